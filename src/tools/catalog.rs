//! The closed set of capabilities and their declared parameters.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::ValidationError;

/// What kind of value a parameter carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    Text,
    /// Filesystem location; resolved and checked before dispatch.
    Path,
    /// Shell command text; scanned by the safety gate.
    Command,
    Integer,
    Number,
    Boolean,
    Object,
    List,
    Any,
}

impl ParamKind {
    pub fn describe(self) -> &'static str {
        match self {
            ParamKind::Text => "a string",
            ParamKind::Path => "a non-empty path string",
            ParamKind::Command => "a non-empty command string",
            ParamKind::Integer => "an integer",
            ParamKind::Number => "a number",
            ParamKind::Boolean => "a boolean",
            ParamKind::Object => "an object",
            ParamKind::List => "a list",
            ParamKind::Any => "any value",
        }
    }
}

/// One declared parameter of a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub required: bool,
    pub description: &'static str,
}

const fn req(name: &'static str, kind: ParamKind, description: &'static str) -> ParamSpec {
    ParamSpec {
        name,
        kind,
        required: true,
        description,
    }
}

const fn opt(name: &'static str, kind: ParamKind, description: &'static str) -> ParamSpec {
    ParamSpec {
        name,
        kind,
        required: false,
        description,
    }
}

use ParamKind::*;

const PATH: ParamSpec = req("path", Path, "file location");
const CONTENT: ParamSpec = req("content", Text, "text to write");
const SHEET: ParamSpec = opt("sheet_name", Text, "worksheet name");
const SCREEN_FILE: ParamSpec = opt("filename", Text, "file name only, stored in the screenshots folder");
const TIMEOUT: ParamSpec = opt("timeout", Integer, "seconds before the command is killed");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolName {
    CreateTextFile,
    ReadFile,
    EditFile,
    DeleteFile,
    ListFiles,
    CreateDirectory,
    CopyFile,
    MoveFile,
    SearchFiles,
    AppendToFile,
    CreateExcel,
    EditExcel,
    AddExcelChart,
    ReadExcel,
    TakeScreenshot,
    ScreenshotRegion,
    OpenUrl,
    WebFillForm,
    WebClick,
    WebScrape,
    RunShell,
    RunPowershell,
    GetSystemInfo,
    MouseClick,
    TypeText,
    Hotkey,
    WaitSeconds,
    CreateChart,
    CreateWordDocument,
}

impl ToolName {
    pub const ALL: [ToolName; 29] = [
        ToolName::CreateTextFile,
        ToolName::ReadFile,
        ToolName::EditFile,
        ToolName::DeleteFile,
        ToolName::ListFiles,
        ToolName::CreateDirectory,
        ToolName::CopyFile,
        ToolName::MoveFile,
        ToolName::SearchFiles,
        ToolName::AppendToFile,
        ToolName::CreateExcel,
        ToolName::EditExcel,
        ToolName::AddExcelChart,
        ToolName::ReadExcel,
        ToolName::TakeScreenshot,
        ToolName::ScreenshotRegion,
        ToolName::OpenUrl,
        ToolName::WebFillForm,
        ToolName::WebClick,
        ToolName::WebScrape,
        ToolName::RunShell,
        ToolName::RunPowershell,
        ToolName::GetSystemInfo,
        ToolName::MouseClick,
        ToolName::TypeText,
        ToolName::Hotkey,
        ToolName::WaitSeconds,
        ToolName::CreateChart,
        ToolName::CreateWordDocument,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ToolName::CreateTextFile => "create_text_file",
            ToolName::ReadFile => "read_file",
            ToolName::EditFile => "edit_file",
            ToolName::DeleteFile => "delete_file",
            ToolName::ListFiles => "list_files",
            ToolName::CreateDirectory => "create_directory",
            ToolName::CopyFile => "copy_file",
            ToolName::MoveFile => "move_file",
            ToolName::SearchFiles => "search_files",
            ToolName::AppendToFile => "append_to_file",
            ToolName::CreateExcel => "create_excel",
            ToolName::EditExcel => "edit_excel",
            ToolName::AddExcelChart => "add_excel_chart",
            ToolName::ReadExcel => "read_excel",
            ToolName::TakeScreenshot => "take_screenshot",
            ToolName::ScreenshotRegion => "screenshot_region",
            ToolName::OpenUrl => "open_url",
            ToolName::WebFillForm => "web_fill_form",
            ToolName::WebClick => "web_click",
            ToolName::WebScrape => "web_scrape",
            ToolName::RunShell => "run_shell",
            ToolName::RunPowershell => "run_powershell",
            ToolName::GetSystemInfo => "get_system_info",
            ToolName::MouseClick => "mouse_click",
            ToolName::TypeText => "type_text",
            ToolName::Hotkey => "hotkey",
            ToolName::WaitSeconds => "wait_seconds",
            ToolName::CreateChart => "create_chart",
            ToolName::CreateWordDocument => "create_word_document",
        }
    }

    /// Section heading used when listing tools.
    pub fn group(self) -> &'static str {
        use ToolName::*;
        match self {
            CreateTextFile | ReadFile | EditFile | DeleteFile | ListFiles | CreateDirectory
            | CopyFile | MoveFile | SearchFiles | AppendToFile => "FILE OPERATIONS",
            CreateExcel | EditExcel | AddExcelChart | ReadExcel => "EXCEL",
            TakeScreenshot | ScreenshotRegion => "SCREENSHOTS",
            OpenUrl | WebFillForm | WebClick | WebScrape => "WEB / BROWSER",
            RunShell | RunPowershell | GetSystemInfo => "SHELL",
            MouseClick | TypeText | Hotkey | WaitSeconds => "GUI AUTOMATION",
            CreateChart => "CHARTS",
            CreateWordDocument => "WORD DOCUMENTS",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            ToolName::CreateTextFile => "create or overwrite a text file",
            ToolName::ReadFile => "read file contents",
            ToolName::EditFile => "find and replace inside a file",
            ToolName::DeleteFile => "delete a file",
            ToolName::ListFiles => "list directory contents",
            ToolName::CreateDirectory => "create a directory tree",
            ToolName::CopyFile => "copy a file",
            ToolName::MoveFile => "move or rename a file",
            ToolName::SearchFiles => "recursive glob search",
            ToolName::AppendToFile => "append text to a file",
            ToolName::CreateExcel => "create a spreadsheet from {\"headers\":[..],\"rows\":[[..]]}",
            ToolName::EditExcel => "set a single cell",
            ToolName::AddExcelChart => "add a bar, line or pie chart over the sheet data",
            ToolName::ReadExcel => "read all rows",
            ToolName::TakeScreenshot => "capture the whole screen",
            ToolName::ScreenshotRegion => "capture a rectangle of the screen",
            ToolName::OpenUrl => "open a web page",
            ToolName::WebFillForm => "fill form fields, fields: {\"selector\":\"value\"}",
            ToolName::WebClick => "click an element",
            ToolName::WebScrape => "extract page text or the text of matching elements",
            ToolName::RunShell => "run a shell command",
            ToolName::RunPowershell => "run a PowerShell command",
            ToolName::GetSystemInfo => "report platform, CPU and memory",
            ToolName::MouseClick => "click at screen coordinates",
            ToolName::TypeText => "type text at the cursor",
            ToolName::Hotkey => "press a key combination, e.g. \"ctrl+c\"",
            ToolName::WaitSeconds => "pause",
            ToolName::CreateChart => "render a chart from {\"Label\":value} or a list",
            ToolName::CreateWordDocument => "write a document from markdown-like text or {title, sections}",
        }
    }

    pub fn parameters(self) -> &'static [ParamSpec] {
        const EDIT_FILE: &[ParamSpec] = &[
            PATH,
            req("old_text", Text, "text to find"),
            req("new_text", Text, "replacement"),
        ];
        const LIST_FILES: &[ParamSpec] = &[opt("directory", Path, "directory to list")];
        const TRANSFER: &[ParamSpec] = &[
            req("source", Path, "existing file"),
            req("destination", Path, "target location"),
        ];
        const SEARCH_FILES: &[ParamSpec] = &[
            req("directory", Path, "where to search"),
            req("pattern", Text, "glob such as *.txt"),
        ];
        const CREATE_EXCEL: &[ParamSpec] = &[
            PATH,
            req("data", Any, "{\"headers\":[..],\"rows\":[[..]]}, a list of rows, or a list of records"),
            SHEET,
        ];
        const EDIT_EXCEL: &[ParamSpec] = &[
            PATH,
            req("cell", Text, "A1-style reference"),
            req("value", Any, "new cell value"),
            SHEET,
        ];
        const ADD_EXCEL_CHART: &[ParamSpec] = &[
            PATH,
            opt("chart_type", Text, "bar | line | pie"),
            opt("title", Text, "chart title"),
            SHEET,
        ];
        const SCREENSHOT_REGION: &[ParamSpec] = &[
            req("x", Integer, "left edge"),
            req("y", Integer, "top edge"),
            req("width", Integer, "width in pixels"),
            req("height", Integer, "height in pixels"),
            SCREEN_FILE,
        ];
        const OPEN_URL: &[ParamSpec] = &[req("url", Text, "address to open")];
        const WEB_FILL_FORM: &[ParamSpec] = &[
            opt("url", Text, "page to load first"),
            req("fields", Object, "selector to value"),
        ];
        const WEB_CLICK: &[ParamSpec] =
            &[req("selector", Text, "id, name, CSS selector, XPath or link text")];
        const WEB_SCRAPE: &[ParamSpec] = &[
            opt("url", Text, "page to load; the open page otherwise"),
            opt("selector", Text, "CSS selector"),
        ];
        const SHELL: &[ParamSpec] = &[req("command", Command, "command line"), TIMEOUT];
        const MOUSE_CLICK: &[ParamSpec] = &[
            req("x", Integer, "screen x"),
            req("y", Integer, "screen y"),
            opt("button", Text, "left | right | middle"),
        ];
        const TYPE_TEXT: &[ParamSpec] = &[req("text", Text, "text to type")];
        const HOTKEY: &[ParamSpec] = &[req("keys", Text, "keys joined by +")];
        const WAIT_SECONDS: &[ParamSpec] = &[req("seconds", Number, "how long to wait")];
        const CREATE_CHART: &[ParamSpec] = &[
            req("data", Any, "{\"Label\":value} or a list of numbers"),
            opt("chart_type", Text, "bar | line | pie | scatter"),
            opt("title", Text, "chart title"),
            opt("filename", Text, "output file name"),
            opt("xlabel", Text, "x axis label"),
            opt("ylabel", Text, "y axis label"),
        ];
        const CREATE_WORD_DOCUMENT: &[ParamSpec] = &[
            PATH,
            req("content", Any, "markdown-like text or {title, sections}"),
        ];

        match self {
            ToolName::CreateTextFile | ToolName::AppendToFile => &[PATH, CONTENT],
            ToolName::ReadFile | ToolName::DeleteFile | ToolName::CreateDirectory => &[PATH],
            ToolName::EditFile => EDIT_FILE,
            ToolName::ListFiles => LIST_FILES,
            ToolName::CopyFile | ToolName::MoveFile => TRANSFER,
            ToolName::SearchFiles => SEARCH_FILES,
            ToolName::CreateExcel => CREATE_EXCEL,
            ToolName::EditExcel => EDIT_EXCEL,
            ToolName::AddExcelChart => ADD_EXCEL_CHART,
            ToolName::ReadExcel => &[PATH, SHEET],
            ToolName::TakeScreenshot => &[SCREEN_FILE],
            ToolName::ScreenshotRegion => SCREENSHOT_REGION,
            ToolName::OpenUrl => OPEN_URL,
            ToolName::WebFillForm => WEB_FILL_FORM,
            ToolName::WebClick => WEB_CLICK,
            ToolName::WebScrape => WEB_SCRAPE,
            ToolName::RunShell | ToolName::RunPowershell => SHELL,
            ToolName::GetSystemInfo => &[],
            ToolName::MouseClick => MOUSE_CLICK,
            ToolName::TypeText => TYPE_TEXT,
            ToolName::Hotkey => HOTKEY,
            ToolName::WaitSeconds => WAIT_SECONDS,
            ToolName::CreateChart => CREATE_CHART,
            ToolName::CreateWordDocument => CREATE_WORD_DOCUMENT,
        }
    }

    pub fn param(self, name: &str) -> Option<&'static ParamSpec> {
        self.parameters().iter().find(|p| p.name == name)
    }

    /// One catalog line, e.g. `edit_file(path, old_text, new_text)`.
    pub fn signature(self) -> String {
        let params: Vec<String> = self
            .parameters()
            .iter()
            .map(|p| {
                if p.required {
                    p.name.to_string()
                } else {
                    format!("{}?", p.name)
                }
            })
            .collect();
        format!("{}({})", self.as_str(), params.join(", "))
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolName {
    type Err = ValidationError;

    /// Case-insensitive; surrounding whitespace and `-` for `_` are tolerated.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase().replace('-', "_");
        ToolName::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| ValidationError::UnknownTool(s.trim().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_names_are_unique_and_round_trip() {
        let names: HashSet<&str> = ToolName::ALL.iter().map(|t| t.as_str()).collect();
        assert_eq!(names.len(), ToolName::ALL.len());
        for tool in ToolName::ALL {
            assert_eq!(tool.as_str().parse::<ToolName>().unwrap(), tool);
            let json = serde_json::to_string(&tool).unwrap();
            assert_eq!(json, format!("\"{}\"", tool.as_str()));
        }
    }

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!(" Create_Text_File ".parse::<ToolName>().unwrap(), ToolName::CreateTextFile);
        assert_eq!("run-shell".parse::<ToolName>().unwrap(), ToolName::RunShell);
        assert_eq!(
            "format_disk".parse::<ToolName>(),
            Err(ValidationError::UnknownTool("format_disk".into()))
        );
    }

    #[test]
    fn test_parameter_names_are_unique_per_tool() {
        for tool in ToolName::ALL {
            let names: HashSet<&str> = tool.parameters().iter().map(|p| p.name).collect();
            assert_eq!(names.len(), tool.parameters().len(), "{tool}");
        }
    }

    #[test]
    fn test_signature() {
        assert_eq!(ToolName::EditFile.signature(), "edit_file(path, old_text, new_text)");
        assert_eq!(ToolName::ListFiles.signature(), "list_files(directory?)");
        assert_eq!(ToolName::GetSystemInfo.signature(), "get_system_info()");
    }

    #[test]
    fn test_command_params_only_on_shell_tools() {
        for tool in ToolName::ALL {
            let has_command = tool.parameters().iter().any(|p| p.kind == ParamKind::Command);
            assert_eq!(
                has_command,
                matches!(tool, ToolName::RunShell | ToolName::RunPowershell),
                "{tool}"
            );
        }
    }
}
