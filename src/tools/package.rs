//! Office Open XML package plumbing shared by the spreadsheet and document
//! tools: zip read/write and XML text escaping.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use regex::Regex;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Write `parts` (name, XML) as a zip package at `path`.
pub(crate) fn write_package(path: &Path, parts: &[(String, String)]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file = File::create(path)?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for (name, xml) in parts {
        writer.start_file(name.as_str(), options)?;
        writer.write_all(xml.as_bytes())?;
    }
    writer.finish()?;
    Ok(())
}

/// Every text part of a package, keyed by part name.
pub(crate) fn read_package(path: &Path) -> anyhow::Result<HashMap<String, String>> {
    let file = File::open(path)?;
    let mut archive = ZipArchive::new(file)
        .map_err(|e| anyhow::anyhow!("{} is not a valid package: {}", path.display(), e))?;

    let mut parts = HashMap::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        if !(name.ends_with(".xml") || name.ends_with(".rels")) {
            continue;
        }
        let mut text = String::new();
        entry.read_to_string(&mut text)?;
        parts.insert(name, text);
    }
    Ok(parts)
}

/// Relationship id to absolute part name, for the part at `part_name`.
pub(crate) fn relationships(
    parts: &HashMap<String, String>,
    part_name: &str,
) -> HashMap<String, String> {
    let (dir, file) = match part_name.rsplit_once('/') {
        Some((dir, file)) => (dir, file),
        None => ("", part_name),
    };
    let rels_name = if dir.is_empty() {
        format!("_rels/{}.rels", file)
    } else {
        format!("{}/_rels/{}.rels", dir, file)
    };

    let Some(xml) = parts.get(&rels_name) else {
        return HashMap::new();
    };

    let rel = Regex::new(r"<Relationship\b[^>]*>").ok();
    let mut map = HashMap::new();
    for tag in rel.iter().flat_map(|re| re.find_iter(xml)) {
        let tag = tag.as_str();
        if let (Some(id), Some(target)) = (attr(tag, "Id"), attr(tag, "Target")) {
            map.insert(id, join_part(dir, &target));
        }
    }
    map
}

/// Resolve a relationship target relative to the directory of its source part.
fn join_part(dir: &str, target: &str) -> String {
    if let Some(absolute) = target.strip_prefix('/') {
        return absolute.to_string();
    }
    let mut segments: Vec<&str> = dir.split('/').filter(|s| !s.is_empty()).collect();
    for segment in target.split('/') {
        match segment {
            ".." => {
                segments.pop();
            }
            "." | "" => {}
            s => segments.push(s),
        }
    }
    segments.join("/")
}

/// Value of `name="..."` inside a single start tag.
pub(crate) fn attr(tag: &str, name: &str) -> Option<String> {
    let needle = format!(" {}=\"", name);
    let start = tag.find(&needle)? + needle.len();
    let end = tag[start..].find('"')? + start;
    Some(xml_unescape(&tag[start..end]))
}

pub(crate) fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            // Control characters other than tab/newline are invalid in XML 1.0.
            c if (c as u32) < 0x20 && c != '\t' && c != '\n' && c != '\r' => {}
            c => out.push(c),
        }
    }
    out
}

pub(crate) fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_package_round_trip_and_relationships() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("p.zip");
        write_package(
            &path,
            &[
                ("xl/workbook.xml".to_string(), "<workbook/>".to_string()),
                (
                    "xl/_rels/workbook.xml.rels".to_string(),
                    r#"<Relationships><Relationship Id="rId1" Type="t" Target="worksheets/sheet1.xml"/><Relationship Id="rId2" Type="t" Target="../docProps/app.xml"/></Relationships>"#
                        .to_string(),
                ),
            ],
        )
        .unwrap();

        let parts = read_package(&path).unwrap();
        assert_eq!(parts["xl/workbook.xml"], "<workbook/>");

        let rels = relationships(&parts, "xl/workbook.xml");
        assert_eq!(rels["rId1"], "xl/worksheets/sheet1.xml");
        assert_eq!(rels["rId2"], "docProps/app.xml");
    }

    #[test]
    fn test_not_a_package() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("fake.xlsx");
        std::fs::write(&path, "plain text").unwrap();
        assert!(read_package(&path).is_err());
    }

    #[test]
    fn test_escaping() {
        let raw = "Q&A <\"tag\"> it's";
        assert_eq!(xml_unescape(&xml_escape(raw)), raw);
        assert_eq!(xml_escape("a\u{1}b"), "ab");
        assert_eq!(attr(r#"<sheet name="A&amp;B" r:id="rId1"/>"#, "name").unwrap(), "A&B");
    }
}
