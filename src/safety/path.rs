//! Symbolic path resolution and allowed-root classification.
//!
//! `resolve` turns what the model wrote ("desktop/hello.txt", "~/notes",
//! "report.xlsx", "/tmp/x") into an absolute, lexically normalised path and
//! rejects anything outside the allowed roots or inside a protected system
//! location. Resolution is purely lexical so it is deterministic and
//! idempotent: an already-resolved path resolves to itself.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

use crate::config::Config;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("path is empty")]
    Empty,

    #[error("path '{}' is forbidden: {reason}", path.display())]
    Forbidden { path: PathBuf, reason: String },

    #[error("cannot determine the user's home directory")]
    NoHomeDirectory,
}

/// The user-profile directories that symbolic tokens map to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserDirs {
    pub home: PathBuf,
    pub desktop: PathBuf,
    pub documents: PathBuf,
    pub downloads: PathBuf,
}

impl UserDirs {
    /// Standard layout below `home`.
    pub fn under(home: PathBuf) -> Self {
        Self {
            desktop: home.join("Desktop"),
            documents: home.join("Documents"),
            downloads: home.join("Downloads"),
            home,
        }
    }

    /// Detect the current user's directories from the environment.
    ///
    /// A OneDrive-redirected desktop is preferred when it exists.
    pub fn detect() -> Result<Self, PathError> {
        let home = ["HOME", "USERPROFILE"]
            .iter()
            .filter_map(|key| std::env::var_os(key))
            .map(PathBuf::from)
            .find(|p| !p.as_os_str().is_empty())
            .ok_or(PathError::NoHomeDirectory)?;

        let mut dirs = Self::under(lexical_normalize(&home));
        let onedrive = dirs.home.join("OneDrive").join("Desktop");
        if !dirs.desktop.exists() && onedrive.exists() {
            dirs.desktop = onedrive;
        }
        Ok(dirs)
    }

    fn alias(&self, token: &str) -> Option<&Path> {
        match token.to_lowercase().as_str() {
            "desktop" | "pulpit" => Some(&self.desktop),
            "documents" | "dokumenty" => Some(&self.documents),
            "downloads" | "pobrane" => Some(&self.downloads),
            "home" | "~" => Some(&self.home),
            _ => None,
        }
    }
}

#[cfg(windows)]
const SYSTEM_LOCATIONS: &[&str] = &[
    r"C:\Windows",
    r"C:\Program Files",
    r"C:\Program Files (x86)",
    r"C:\ProgramData",
];

#[cfg(not(windows))]
const SYSTEM_LOCATIONS: &[&str] = &[
    "/etc", "/bin", "/sbin", "/boot", "/usr", "/lib", "/lib64", "/proc", "/sys", "/dev",
    "/var/lib", "/System", "/Library",
];

/// Directories under the home directory that are never writable targets.
const PROTECTED_HOME_DIRS: &[&str] = &[".ssh", ".gnupg"];

/// Maps raw path text to absolute paths and classifies them.
#[derive(Debug, Clone)]
pub struct PathResolver {
    dirs: UserDirs,
    working_dir: PathBuf,
    allowed_roots: Vec<PathBuf>,
    denied: Vec<PathBuf>,
}

impl PathResolver {
    /// Allowed roots: the user profile, the working directory, and the
    /// declared output directories. Further roots can be added.
    pub fn new(dirs: UserDirs, working_dir: PathBuf) -> Self {
        let working_dir = lexical_normalize(&working_dir);
        let mut denied: Vec<PathBuf> = SYSTEM_LOCATIONS.iter().map(PathBuf::from).collect();
        denied.extend(PROTECTED_HOME_DIRS.iter().map(|d| dirs.home.join(d)));

        Self {
            allowed_roots: vec![dirs.home.clone(), working_dir.clone()],
            dirs,
            working_dir,
            denied,
        }
    }

    pub fn from_config(dirs: UserDirs, config: &Config) -> Self {
        let mut resolver = Self::new(dirs, config.working_dir.clone());
        resolver.allow(config.screenshots_dir.clone());
        resolver.allow(config.logs_dir.clone());
        for root in &config.extra_allowed_roots {
            resolver.allow(root.clone());
        }
        resolver
    }

    /// Add an allowed root. Relative roots are taken against the working directory.
    pub fn allow(&mut self, root: PathBuf) {
        let root = self.absolutize(&root);
        if !self.allowed_roots.contains(&root) {
            self.allowed_roots.push(root);
        }
    }

    pub fn dirs(&self) -> &UserDirs {
        &self.dirs
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn allowed_roots(&self) -> &[PathBuf] {
        &self.allowed_roots
    }

    /// Expand aliases and normalise, without classifying.
    pub fn expand(&self, raw: &str) -> Result<PathBuf, PathError> {
        let raw = raw.trim().trim_matches('"');
        if raw.is_empty() {
            return Err(PathError::Empty);
        }

        let path = Path::new(raw);
        if path.is_absolute() {
            return Ok(lexical_normalize(path));
        }

        let unified = raw.replace('\\', "/");
        let (first, rest) = match unified.split_once('/') {
            Some((first, rest)) => (first, rest),
            None => (unified.as_str(), ""),
        };

        let base = match self.dirs.alias(first) {
            Some(base) => base.to_path_buf(),
            None => return Ok(lexical_normalize(&self.working_dir.join(&unified))),
        };

        let joined = if rest.is_empty() { base } else { base.join(rest) };
        Ok(lexical_normalize(&joined))
    }

    /// Resolve and reject forbidden locations.
    pub fn resolve(&self, raw: &str) -> Result<PathBuf, PathError> {
        let path = self.expand(raw)?;
        self.check(&path)?;
        Ok(path)
    }

    /// Classify an absolute path.
    pub fn check(&self, path: &Path) -> Result<(), PathError> {
        if let Some(denied) = self.denied.iter().find(|d| path.starts_with(d)) {
            // An explicitly allowed root below a system location wins.
            let explicitly_allowed = self
                .allowed_roots
                .iter()
                .any(|root| root.starts_with(denied) && path.starts_with(root));
            if !explicitly_allowed {
                return Err(PathError::Forbidden {
                    path: path.to_path_buf(),
                    reason: format!("'{}' is a protected location", denied.display()),
                });
            }
        }

        if self.allowed_roots.iter().any(|root| path.starts_with(root)) {
            Ok(())
        } else {
            Err(PathError::Forbidden {
                path: path.to_path_buf(),
                reason: "outside the allowed directories".to_string(),
            })
        }
    }

    pub fn is_allowed(&self, path: &Path) -> bool {
        self.check(path).is_ok()
    }

    fn absolutize(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            lexical_normalize(path)
        } else {
            lexical_normalize(&self.working_dir.join(path))
        }
    }
}

/// Remove `.` components and fold `..` without touching the filesystem.
/// `..` never climbs above the root.
pub fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                let at_root = matches!(
                    out.components().next_back(),
                    None | Some(Component::RootDir) | Some(Component::Prefix(_))
                );
                if !at_root {
                    out.pop();
                }
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn resolver() -> PathResolver {
        PathResolver::new(
            UserDirs::under(PathBuf::from("/home/ola")),
            PathBuf::from("/home/ola/atlas_workspace"),
        )
    }

    #[test]
    fn test_aliases_are_case_insensitive() {
        let r = resolver();
        assert_eq!(
            r.resolve("desktop/hello.txt").unwrap(),
            PathBuf::from("/home/ola/Desktop/hello.txt")
        );
        assert_eq!(
            r.resolve("Desktop\\hello.txt").unwrap(),
            PathBuf::from("/home/ola/Desktop/hello.txt")
        );
        assert_eq!(r.resolve("PULPIT").unwrap(), PathBuf::from("/home/ola/Desktop"));
        assert_eq!(
            r.resolve("dokumenty/raport.docx").unwrap(),
            PathBuf::from("/home/ola/Documents/raport.docx")
        );
        assert_eq!(r.resolve("pobrane").unwrap(), PathBuf::from("/home/ola/Downloads"));
        assert_eq!(r.resolve("home").unwrap(), PathBuf::from("/home/ola"));
        assert_eq!(r.resolve("~/notes.txt").unwrap(), PathBuf::from("/home/ola/notes.txt"));
    }

    #[test]
    fn test_relative_paths_land_in_working_dir() {
        let r = resolver();
        assert_eq!(
            r.resolve("out/./report.xlsx").unwrap(),
            PathBuf::from("/home/ola/atlas_workspace/out/report.xlsx")
        );
        // A token only counts as an alias when it is the whole first segment.
        assert_eq!(
            r.resolve("desktops/a.txt").unwrap(),
            PathBuf::from("/home/ola/atlas_workspace/desktops/a.txt")
        );
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let r = resolver();
        for raw in ["desktop/hello.txt", "documents", "x/../y.txt", "~", "/home/ola/a/b"] {
            let once = r.resolve(raw).unwrap();
            let twice = r.resolve(once.to_str().unwrap()).unwrap();
            assert_eq!(once, twice, "{raw}");
        }
    }

    #[test]
    fn test_outside_allowed_roots_is_forbidden() {
        let r = resolver();
        for raw in ["/tmp/x.txt", "/home/other/file", "../../../../etc/passwd", "desktop/../../bob"] {
            assert!(
                matches!(r.resolve(raw), Err(PathError::Forbidden { .. })),
                "{raw} should be forbidden"
            );
        }
    }

    #[test]
    fn test_protected_locations_are_forbidden() {
        let r = resolver();
        assert!(matches!(
            r.resolve("~/.ssh/id_rsa"),
            Err(PathError::Forbidden { .. })
        ));

        let mut wide = PathResolver::new(UserDirs::under(PathBuf::from("/home/ola")), PathBuf::from("/"));
        wide.allow(PathBuf::from("/srv"));
        assert!(wide.resolve("/srv/data.csv").is_ok());
        assert!(matches!(wide.resolve("/etc/hosts"), Err(PathError::Forbidden { .. })));
        assert!(matches!(wide.resolve("/usr/bin/ls"), Err(PathError::Forbidden { .. })));
    }

    #[test]
    fn test_explicit_root_inside_system_location() {
        let mut r = resolver();
        r.allow(PathBuf::from("/usr/local/share/atlas"));
        assert!(r.resolve("/usr/local/share/atlas/a.txt").is_ok());
        assert!(r.resolve("/usr/local/bin/x").is_err());
    }

    #[test]
    fn test_config_output_dirs_are_allowed() {
        let mut config = Config::new(PathBuf::from("/home/ola/atlas_workspace"));
        config.extra_allowed_roots.push(PathBuf::from("/mnt/shared"));
        let r = PathResolver::from_config(UserDirs::under(PathBuf::from("/home/ola")), &config);
        assert!(r.resolve("/mnt/shared/q3.xlsx").is_ok());
        assert!(r.resolve("/mnt/other/q3.xlsx").is_err());
    }

    #[test]
    fn test_empty_path() {
        assert_eq!(resolver().resolve("   "), Err(PathError::Empty));
    }

    #[test]
    fn test_lexical_normalize_never_climbs_above_root() {
        assert_eq!(lexical_normalize(Path::new("/../../a/./b/..")), PathBuf::from("/a"));
    }
}
