//! Spreadsheet tools backed by a small in-memory workbook model that is
//! written to and read from `.xlsx` packages.
//!
//! Styling is derived from the content on every write: the first row is the
//! header, a trailing `TOTAL` row is bold, and data rows alternate fills. A
//! sheet may carry one chart over its data range.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};

use super::package::{attr, read_package, relationships, write_package, xml_escape, xml_unescape};
use super::{opt_str_arg, str_arg, Arguments, Tool, ToolContext, ToolName, ToolOutput};

const NS_MAIN: &str = "http://schemas.openxmlformats.org/spreadsheetml/2006/main";
const NS_REL: &str = "http://schemas.openxmlformats.org/officeDocument/2006/relationships";
const NS_CHART: &str = "http://schemas.openxmlformats.org/drawingml/2006/chart";
const NS_DRAWING: &str = "http://schemas.openxmlformats.org/drawingml/2006/main";
const NS_SHEET_DRAWING: &str = "http://schemas.openxmlformats.org/drawingml/2006/spreadsheetDrawing";
const REL_BASE: &str = "http://schemas.openxmlformats.org/officeDocument/2006/relationships";
const TOTAL_LABEL: &str = "TOTAL";

const STYLE_HEADER: u8 = 1;
const STYLE_BODY: u8 = 2;
const STYLE_BODY_ALT: u8 = 3;
const STYLE_TOTAL: u8 = 4;

/// One cell of a worksheet.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Empty,
    Number(f64),
    Bool(bool),
    Text(String),
    /// Formula text without the leading `=`.
    Formula(String),
}

impl CellValue {
    /// Numeric-looking strings become numbers and `=...` becomes a formula.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => CellValue::Empty,
            Value::Bool(b) => CellValue::Bool(*b),
            Value::Number(n) => n.as_f64().map_or(CellValue::Empty, CellValue::Number),
            Value::String(s) => Self::from_text(s),
            other => CellValue::Text(other.to_string()),
        }
    }

    pub fn from_text(s: &str) -> Self {
        let trimmed = s.trim();
        if let Some(formula) = trimmed.strip_prefix('=') {
            if !formula.is_empty() {
                return CellValue::Formula(formula.to_string());
            }
        }
        match trimmed.parse::<f64>() {
            Ok(n) if !trimmed.is_empty() && n.is_finite() => CellValue::Number(n),
            _ if s.is_empty() => CellValue::Empty,
            _ => CellValue::Text(s.to_string()),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            CellValue::Empty => Value::Null,
            CellValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => json!(*n as i64),
            CellValue::Number(n) => json!(n),
            CellValue::Bool(b) => json!(b),
            CellValue::Text(s) => json!(s),
            CellValue::Formula(f) => json!(format!("={}", f)),
        }
    }

    pub fn is_number(&self) -> bool {
        matches!(self, CellValue::Number(_))
    }

    fn display_len(&self) -> usize {
        match self {
            CellValue::Empty => 0,
            CellValue::Text(s) => s.chars().count(),
            other => other.to_json().to_string().trim_matches('"').chars().count(),
        }
    }
}

/// Chart types an embedded sheet chart can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SheetChartKind {
    Bar,
    Line,
    Pie,
}

impl SheetChartKind {
    /// Unknown names fall back to a bar chart.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "line" => SheetChartKind::Line,
            "pie" => SheetChartKind::Pie,
            _ => SheetChartKind::Bar,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SheetChartKind::Bar => "bar",
            SheetChartKind::Line => "line",
            SheetChartKind::Pie => "pie",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SheetChart {
    pub kind: SheetChartKind,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Worksheet {
    pub name: String,
    pub rows: Vec<Vec<CellValue>>,
    pub chart: Option<SheetChart>,
}

impl Worksheet {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: Vec::new(),
            chart: None,
        }
    }

    pub fn width(&self) -> usize {
        self.rows.iter().map(Vec::len).max().unwrap_or(0)
    }

    fn has_total_row(&self) -> bool {
        self.rows.len() > 1
            && matches!(
                self.rows.last().and_then(|r| r.first()),
                Some(CellValue::Text(t)) if t.eq_ignore_ascii_case(TOTAL_LABEL)
            )
    }

    /// Number of rows holding header + data, i.e. excluding a trailing TOTAL row.
    pub fn data_row_count(&self) -> usize {
        if self.has_total_row() {
            self.rows.len() - 1
        } else {
            self.rows.len()
        }
    }

    pub fn get(&self, reference: &str) -> Option<&CellValue> {
        let (col, row) = parse_cell_ref(reference)?;
        self.rows.get(row).and_then(|r| r.get(col))
    }

    pub fn set(&mut self, reference: &str, value: CellValue) -> anyhow::Result<()> {
        let (col, row) = parse_cell_ref(reference)
            .ok_or_else(|| anyhow::anyhow!("Invalid cell reference '{}'", reference))?;
        if self.rows.len() <= row {
            self.rows.resize(row + 1, Vec::new());
        }
        let cells = &mut self.rows[row];
        if cells.len() <= col {
            cells.resize(col + 1, CellValue::Empty);
        }
        cells[col] = value;
        Ok(())
    }

    fn style_for_row(&self, row: usize) -> u8 {
        if row == 0 {
            STYLE_HEADER
        } else if self.has_total_row() && row == self.rows.len() - 1 {
            STYLE_TOTAL
        } else if (row + 1) % 2 == 0 {
            STYLE_BODY_ALT
        } else {
            STYLE_BODY
        }
    }

    fn to_xml(&self, drawing_rel: Option<&str>) -> String {
        let width = self.width();
        let mut xml = format!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><worksheet xmlns="{}" xmlns:r="{}">"#,
            NS_MAIN, NS_REL
        );

        if width > 0 && !self.rows.is_empty() {
            xml.push_str(&format!(
                r#"<dimension ref="A1:{}{}"/>"#,
                column_name(width - 1),
                self.rows.len()
            ));
            xml.push_str("<cols>");
            for col in 0..width {
                let longest = self
                    .rows
                    .iter()
                    .filter_map(|r| r.get(col))
                    .map(CellValue::display_len)
                    .max()
                    .unwrap_or(0);
                let col_width = (longest + 4).min(50).max(8);
                xml.push_str(&format!(
                    r#"<col min="{n}" max="{n}" width="{w}" customWidth="1"/>"#,
                    n = col + 1,
                    w = col_width
                ));
            }
            xml.push_str("</cols>");
        }

        xml.push_str("<sheetData>");
        for (r, cells) in self.rows.iter().enumerate() {
            let style = self.style_for_row(r);
            xml.push_str(&format!(r#"<row r="{}">"#, r + 1));
            for (c, cell) in cells.iter().enumerate() {
                let reference = format!("{}{}", column_name(c), r + 1);
                match cell {
                    CellValue::Empty => {}
                    CellValue::Number(n) => xml.push_str(&format!(
                        r#"<c r="{}" s="{}"><v>{}</v></c>"#,
                        reference, style, n
                    )),
                    CellValue::Bool(b) => xml.push_str(&format!(
                        r#"<c r="{}" s="{}" t="b"><v>{}</v></c>"#,
                        reference,
                        style,
                        u8::from(*b)
                    )),
                    CellValue::Text(t) => xml.push_str(&format!(
                        r#"<c r="{}" s="{}" t="inlineStr"><is><t xml:space="preserve">{}</t></is></c>"#,
                        reference,
                        style,
                        xml_escape(t)
                    )),
                    CellValue::Formula(f) => xml.push_str(&format!(
                        r#"<c r="{}" s="{}"><f>{}</f></c>"#,
                        reference,
                        style,
                        xml_escape(f)
                    )),
                }
            }
            xml.push_str("</row>");
        }
        xml.push_str("</sheetData>");

        let data_rows = self.data_row_count();
        if width > 0 && data_rows > 1 {
            xml.push_str(&format!(
                r#"<autoFilter ref="A1:{}{}"/>"#,
                column_name(width - 1),
                data_rows
            ));
        }
        if let Some(rel) = drawing_rel {
            xml.push_str(&format!(r#"<drawing r:id="{}"/>"#, rel));
        }
        xml.push_str("</worksheet>");
        xml
    }
}

/// An ordered set of worksheets.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Workbook {
    pub sheets: Vec<Worksheet>,
}

impl Workbook {
    /// Build a single-sheet workbook from the accepted `data` shapes.
    ///
    /// A TOTAL row with column sums is appended when the second column
    /// holds numbers.
    pub fn from_data(data: &Value, sheet_name: &str) -> anyhow::Result<Self> {
        let (headers, rows) = table_from_data(data)?;
        if headers.is_empty() {
            return Err(anyhow::anyhow!("Could not parse data"));
        }

        let mut sheet = Worksheet::new(sheet_name);
        sheet
            .rows
            .push(headers.iter().map(|h| CellValue::Text(h.clone())).collect());
        for row in &rows {
            sheet.rows.push(row.iter().map(CellValue::from_json).collect());
        }

        let numeric = sheet.rows[1..]
            .iter()
            .any(|r| r.get(1).map_or(false, CellValue::is_number));
        if headers.len() >= 2 && numeric {
            let last = rows.len() + 1;
            let mut total = vec![CellValue::Text(TOTAL_LABEL.to_string())];
            for col in 1..headers.len() {
                let name = column_name(col);
                total.push(CellValue::Formula(format!("SUM({n}2:{n}{last})", n = name)));
            }
            sheet.rows.push(total);
        }

        Ok(Self {
            sheets: vec![sheet],
        })
    }

    /// The named sheet, or the first one when the name is absent or unknown.
    pub fn sheet(&self, name: Option<&str>) -> Option<&Worksheet> {
        name.and_then(|n| self.sheets.iter().find(|s| s.name.eq_ignore_ascii_case(n)))
            .or_else(|| self.sheets.first())
    }

    pub fn sheet_mut(&mut self, name: Option<&str>) -> Option<&mut Worksheet> {
        let index = name
            .and_then(|n| self.sheets.iter().position(|s| s.name.eq_ignore_ascii_case(n)))
            .unwrap_or(0);
        self.sheets.get_mut(index)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if self.sheets.is_empty() {
            return Err(anyhow::anyhow!("A workbook needs at least one sheet"));
        }
        write_package(path, &self.parts())
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let parts = read_package(path)?;
        parse_workbook(&parts)
    }

    fn parts(&self) -> Vec<(String, String)> {
        let mut parts = Vec::new();
        let mut overrides = vec![
            (
                "/xl/workbook.xml".to_string(),
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml",
            ),
            (
                "/xl/styles.xml".to_string(),
                "application/vnd.openxmlformats-officedocument.spreadsheetml.styles+xml",
            ),
        ];

        let mut sheets_xml = String::new();
        let mut workbook_rels = String::new();
        for (i, sheet) in self.sheets.iter().enumerate() {
            let n = i + 1;
            sheets_xml.push_str(&format!(
                r#"<sheet name="{}" sheetId="{}" r:id="rId{}"/>"#,
                xml_escape(&sheet_title(&sheet.name, n)),
                n,
                n
            ));
            workbook_rels.push_str(&format!(
                r#"<Relationship Id="rId{}" Type="{}/worksheet" Target="worksheets/sheet{}.xml"/>"#,
                n, REL_BASE, n
            ));
            overrides.push((
                format!("/xl/worksheets/sheet{}.xml", n),
                "application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml",
            ));

            let chart = sheet.chart.as_ref().filter(|_| sheet.data_row_count() >= 2 && sheet.width() >= 2);
            let drawing_rel = chart.map(|_| "rId1");
            parts.push((format!("xl/worksheets/sheet{}.xml", n), sheet.to_xml(drawing_rel)));

            if let Some(chart) = chart {
                parts.push((
                    format!("xl/worksheets/_rels/sheet{}.xml.rels", n),
                    relationships_xml(&[(
                        "rId1",
                        "drawing",
                        format!("../drawings/drawing{}.xml", n),
                    )]),
                ));
                parts.push((format!("xl/drawings/drawing{}.xml", n), drawing_xml(sheet.rows.len())));
                parts.push((
                    format!("xl/drawings/_rels/drawing{}.xml.rels", n),
                    relationships_xml(&[("rId1", "chart", format!("../charts/chart{}.xml", n))]),
                ));
                parts.push((
                    format!("xl/charts/chart{}.xml", n),
                    chart_xml(sheet, &sheet_title(&sheet.name, n), chart),
                ));
                overrides.push((
                    format!("/xl/drawings/drawing{}.xml", n),
                    "application/vnd.openxmlformats-officedocument.drawing+xml",
                ));
                overrides.push((
                    format!("/xl/charts/chart{}.xml", n),
                    "application/vnd.openxmlformats-officedocument.drawingml.chart+xml",
                ));
            }
        }
        workbook_rels.push_str(&format!(
            r#"<Relationship Id="rId{}" Type="{}/styles" Target="styles.xml"/>"#,
            self.sheets.len() + 1,
            REL_BASE
        ));

        parts.push((
            "xl/workbook.xml".to_string(),
            format!(
                r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><workbook xmlns="{}" xmlns:r="{}"><sheets>{}</sheets><calcPr calcId="191029" fullCalcOnLoad="1"/></workbook>"#,
                NS_MAIN, NS_REL, sheets_xml
            ),
        ));
        parts.push((
            "xl/_rels/workbook.xml.rels".to_string(),
            format!(
                r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">{}</Relationships>"#,
                workbook_rels
            ),
        ));
        parts.push(("xl/styles.xml".to_string(), STYLES_XML.to_string()));
        parts.push((
            "_rels/.rels".to_string(),
            relationships_xml(&[("rId1", "officeDocument", "xl/workbook.xml".to_string())]),
        ));

        let overrides_xml: String = overrides
            .iter()
            .map(|(part, content_type)| {
                format!(r#"<Override PartName="{}" ContentType="{}"/>"#, part, content_type)
            })
            .collect();
        parts.insert(
            0,
            (
                "[Content_Types].xml".to_string(),
                format!(
                    r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/>{}</Types>"#,
                    overrides_xml
                ),
            ),
        );
        parts
    }
}

/// Sheet names are limited to 31 characters without `[]:*?/\`.
fn sheet_title(name: &str, index: usize) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| !matches!(c, '[' | ']' | ':' | '*' | '?' | '/' | '\\'))
        .take(31)
        .collect();
    if cleaned.trim().is_empty() {
        format!("Sheet{}", index)
    } else {
        cleaned
    }
}

fn relationships_xml(rels: &[(&str, &str, String)]) -> String {
    let body: String = rels
        .iter()
        .map(|(id, kind, target)| {
            format!(
                r#"<Relationship Id="{}" Type="{}/{}" Target="{}"/>"#,
                id, REL_BASE, kind, target
            )
        })
        .collect();
    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">{}</Relationships>"#,
        body
    )
}

/// Anchor the chart two rows below the sheet content.
fn drawing_xml(row_count: usize) -> String {
    let top = row_count + 2;
    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><xdr:wsDr xmlns:xdr="{sd}" xmlns:a="{a}"><xdr:twoCellAnchor><xdr:from><xdr:col>0</xdr:col><xdr:colOff>0</xdr:colOff><xdr:row>{top}</xdr:row><xdr:rowOff>0</xdr:rowOff></xdr:from><xdr:to><xdr:col>9</xdr:col><xdr:colOff>0</xdr:colOff><xdr:row>{bottom}</xdr:row><xdr:rowOff>0</xdr:rowOff></xdr:to><xdr:graphicFrame macro=""><xdr:nvGraphicFramePr><xdr:cNvPr id="2" name="Chart 1"/><xdr:cNvGraphicFramePr/></xdr:nvGraphicFramePr><xdr:xfrm><a:off x="0" y="0"/><a:ext cx="0" cy="0"/></xdr:xfrm><a:graphic><a:graphicData uri="{c}"><c:chart xmlns:c="{c}" xmlns:r="{r}" r:id="rId1"/></a:graphicData></a:graphic></xdr:graphicFrame><xdr:clientData/></xdr:twoCellAnchor></xdr:wsDr>"#,
        sd = NS_SHEET_DRAWING,
        a = NS_DRAWING,
        c = NS_CHART,
        r = NS_REL,
        top = top,
        bottom = top + 20
    )
}

fn chart_xml(sheet: &Worksheet, sheet_name: &str, chart: &SheetChart) -> String {
    let last_row = sheet.data_row_count();
    let quoted = format!("'{}'", sheet_name.replace('\'', "''"));
    let categories = format!("{q}!$A$2:$A${last}", q = quoted, last = last_row);

    let value_columns: Vec<usize> = match chart.kind {
        SheetChartKind::Pie => vec![1],
        _ => (1..sheet.width()).collect(),
    };

    let mut series = String::new();
    for (i, col) in value_columns.iter().enumerate() {
        let name = column_name(*col);
        series.push_str(&format!(
            r#"<c:ser><c:idx val="{i}"/><c:order val="{i}"/><c:tx><c:strRef><c:f>{q}!${n}$1</c:f></c:strRef></c:tx><c:cat><c:strRef><c:f>{cat}</c:f></c:strRef></c:cat><c:val><c:numRef><c:f>{q}!${n}$2:${n}${last}</c:f></c:numRef></c:val></c:ser>"#,
            i = i,
            q = xml_escape(&quoted),
            n = name,
            cat = xml_escape(&categories),
            last = last_row
        ));
    }

    let axes_ids = r#"<c:axId val="500000001"/><c:axId val="500000002"/>"#;
    let plot = match chart.kind {
        SheetChartKind::Bar => format!(
            r#"<c:barChart><c:barDir val="col"/><c:grouping val="clustered"/><c:varyColors val="0"/>{}{}</c:barChart>"#,
            series, axes_ids
        ),
        SheetChartKind::Line => format!(
            r#"<c:lineChart><c:grouping val="standard"/><c:varyColors val="0"/>{}<c:marker val="1"/>{}</c:lineChart>"#,
            series, axes_ids
        ),
        SheetChartKind::Pie => format!(
            r#"<c:pieChart><c:varyColors val="1"/>{}<c:firstSliceAng val="0"/></c:pieChart>"#,
            series
        ),
    };
    let axes = if chart.kind == SheetChartKind::Pie {
        String::new()
    } else {
        r#"<c:catAx><c:axId val="500000001"/><c:scaling><c:orientation val="minMax"/></c:scaling><c:delete val="0"/><c:axPos val="b"/><c:crossAx val="500000002"/></c:catAx><c:valAx><c:axId val="500000002"/><c:scaling><c:orientation val="minMax"/></c:scaling><c:delete val="0"/><c:axPos val="l"/><c:majorGridlines/><c:crossAx val="500000001"/></c:valAx>"#.to_string()
    };

    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><c:chartSpace xmlns:c="{c}" xmlns:a="{a}" xmlns:r="{r}"><c:chart><c:title><c:tx><c:rich><a:bodyPr/><a:p><a:r><a:t>{title}</a:t></a:r></a:p></c:rich></c:tx><c:overlay val="0"/></c:title><c:autoTitleDeleted val="0"/><c:plotArea><c:layout/>{plot}{axes}</c:plotArea><c:legend><c:legendPos val="r"/><c:overlay val="0"/></c:legend><c:plotVisOnly val="1"/></c:chart></c:chartSpace>"#,
        c = NS_CHART,
        a = NS_DRAWING,
        r = NS_REL,
        title = xml_escape(&chart.title),
        plot = plot,
        axes = axes
    )
}

const STYLES_XML: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><styleSheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><fonts count="3"><font><sz val="11"/><name val="Calibri"/></font><font><b/><sz val="11"/><color rgb="FFFFFFFF"/><name val="Calibri"/></font><font><b/><sz val="11"/><name val="Calibri"/></font></fonts><fills count="4"><fill><patternFill patternType="none"/></fill><fill><patternFill patternType="gray125"/></fill><fill><patternFill patternType="solid"><fgColor rgb="FF4472C4"/><bgColor indexed="64"/></patternFill></fill><fill><patternFill patternType="solid"><fgColor rgb="FFD9E2F3"/><bgColor indexed="64"/></patternFill></fill></fills><borders count="2"><border><left/><right/><top/><bottom/><diagonal/></border><border><left style="thin"><color auto="1"/></left><right style="thin"><color auto="1"/></right><top style="thin"><color auto="1"/></top><bottom style="thin"><color auto="1"/></bottom><diagonal/></border></borders><cellStyleXfs count="1"><xf numFmtId="0" fontId="0" fillId="0" borderId="0"/></cellStyleXfs><cellXfs count="5"><xf numFmtId="0" fontId="0" fillId="0" borderId="0" xfId="0"/><xf numFmtId="0" fontId="1" fillId="2" borderId="1" xfId="0" applyFont="1" applyFill="1" applyBorder="1" applyAlignment="1"><alignment horizontal="center" vertical="center"/></xf><xf numFmtId="0" fontId="0" fillId="0" borderId="1" xfId="0" applyBorder="1" applyAlignment="1"><alignment horizontal="center"/></xf><xf numFmtId="0" fontId="0" fillId="3" borderId="1" xfId="0" applyFill="1" applyBorder="1" applyAlignment="1"><alignment horizontal="center"/></xf><xf numFmtId="0" fontId="2" fillId="0" borderId="1" xfId="0" applyFont="1" applyBorder="1" applyAlignment="1"><alignment horizontal="center"/></xf></cellXfs><cellStyles count="1"><cellStyle name="Normal" xfId="0" builtinId="0"/></cellStyles></styleSheet>"#;

fn parse_workbook(parts: &HashMap<String, String>) -> anyhow::Result<Workbook> {
    let workbook_xml = parts
        .get("xl/workbook.xml")
        .ok_or_else(|| anyhow::anyhow!("Not a spreadsheet: xl/workbook.xml is missing"))?;
    let workbook_rels = relationships(parts, "xl/workbook.xml");
    let shared = parts
        .get("xl/sharedStrings.xml")
        .map(|xml| shared_strings(xml))
        .unwrap_or_default();

    let sheet_tag = Regex::new(r"<sheet\b[^>]*>")?;
    let mut sheets = Vec::new();
    for tag in sheet_tag.find_iter(workbook_xml) {
        let tag = tag.as_str();
        let name = attr(tag, "name").unwrap_or_else(|| format!("Sheet{}", sheets.len() + 1));
        let part = attr(tag, "r:id")
            .and_then(|id| workbook_rels.get(&id).cloned())
            .unwrap_or_else(|| format!("xl/worksheets/sheet{}.xml", sheets.len() + 1));
        let Some(xml) = parts.get(&part) else {
            continue;
        };

        let mut sheet = Worksheet::new(name);
        sheet.rows = parse_sheet_rows(xml, &shared)?;
        sheet.chart = sheet_chart(parts, &part);
        sheets.push(sheet);
    }

    if sheets.is_empty() {
        return Err(anyhow::anyhow!("Workbook has no readable sheets"));
    }
    Ok(Workbook { sheets })
}

fn shared_strings(xml: &str) -> Vec<String> {
    let (Ok(item), Ok(text)) = (
        Regex::new(r"(?s)<si>(.*?)</si>"),
        Regex::new(r"(?s)<t(?:\s[^>]*)?>(.*?)</t>"),
    ) else {
        return Vec::new();
    };
    item.captures_iter(xml)
        .map(|si| {
            text.captures_iter(&si[1])
                .map(|t| xml_unescape(&t[1]))
                .collect::<String>()
        })
        .collect()
}

fn parse_sheet_rows(xml: &str, shared: &[String]) -> anyhow::Result<Vec<Vec<CellValue>>> {
    let cell_re = Regex::new(r"(?s)<c\b([^>]*?)(?:/>|>(.*?)</c>)")?;
    let formula_re = Regex::new(r"(?s)<f(?:\s[^>]*)?>(.*?)</f>")?;
    let value_re = Regex::new(r"(?s)<v>(.*?)</v>")?;
    let inline_re = Regex::new(r"(?s)<t(?:\s[^>]*)?>(.*?)</t>")?;

    let mut sheet = Worksheet::new("");
    for cap in cell_re.captures_iter(xml) {
        let attrs = &cap[1];
        let Some(reference) = attr(attrs, "r") else {
            continue;
        };
        let body = cap.get(2).map_or("", |m| m.as_str());
        let cell_type = attr(attrs, "t").unwrap_or_default();

        let value = if let Some(f) = formula_re.captures(body) {
            CellValue::Formula(xml_unescape(&f[1]))
        } else {
            let raw = value_re.captures(body).map(|v| xml_unescape(&v[1]));
            match (cell_type.as_str(), raw) {
                ("s", Some(index)) => index
                    .trim()
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| shared.get(i))
                    .map_or(CellValue::Empty, |s| CellValue::Text(s.clone())),
                ("inlineStr", _) => {
                    let text: String = inline_re
                        .captures_iter(body)
                        .map(|t| xml_unescape(&t[1]))
                        .collect();
                    CellValue::Text(text)
                }
                ("b", Some(v)) => CellValue::Bool(v.trim() == "1"),
                ("str", Some(v)) | ("e", Some(v)) => CellValue::Text(v),
                (_, Some(v)) => v
                    .trim()
                    .parse::<f64>()
                    .map(CellValue::Number)
                    .unwrap_or(CellValue::Text(v)),
                (_, None) => CellValue::Empty,
            }
        };
        if value != CellValue::Empty {
            sheet.set(&reference, value)?;
        }
    }
    Ok(sheet.rows)
}

fn sheet_chart(parts: &HashMap<String, String>, sheet_part: &str) -> Option<SheetChart> {
    let drawing = relationships(parts, sheet_part)
        .into_values()
        .find(|target| target.contains("drawings/"))?;
    let chart_part = relationships(parts, &drawing)
        .into_values()
        .find(|target| target.contains("charts/"))?;
    let xml = parts.get(&chart_part)?;

    let kind = if xml.contains("<c:pieChart") {
        SheetChartKind::Pie
    } else if xml.contains("<c:lineChart") {
        SheetChartKind::Line
    } else {
        SheetChartKind::Bar
    };
    let title = Regex::new(r"(?s)<a:t>(.*?)</a:t>")
        .ok()
        .and_then(|re| re.captures(xml).map(|c| xml_unescape(&c[1])))
        .unwrap_or_default();
    Some(SheetChart { kind, title })
}

/// Normalise the accepted data shapes into headers and rows.
fn table_from_data(data: &Value) -> anyhow::Result<(Vec<String>, Vec<Vec<Value>>)> {
    fn label(v: &Value) -> String {
        match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
    fn as_row(v: &Value) -> Vec<Value> {
        match v {
            Value::Array(cells) => cells.clone(),
            other => vec![other.clone()],
        }
    }

    let table = match data {
        // Some models send the table as a JSON string.
        Value::String(s) if s.trim_start().starts_with(['{', '[']) => {
            let parsed: Value = serde_json::from_str(s)
                .map_err(|e| anyhow::anyhow!("'data' is not valid JSON: {}", e))?;
            return table_from_data(&parsed);
        }
        Value::Object(map) if map.contains_key("headers") && map.contains_key("rows") => {
            let headers = match &map["headers"] {
                Value::Array(h) => h.iter().map(label).collect(),
                other => vec![label(other)],
            };
            let rows = match &map["rows"] {
                Value::Array(rows) => rows.iter().map(as_row).collect(),
                other => vec![as_row(other)],
            };
            (headers, rows)
        }
        Value::Object(map) if !map.is_empty() && map.values().all(Value::is_array) => {
            let headers: Vec<String> = map.keys().cloned().collect();
            let height = map.values().filter_map(Value::as_array).map(Vec::len).max().unwrap_or(0);
            let rows = (0..height)
                .map(|i| {
                    map.values()
                        .map(|col| col.get(i).cloned().unwrap_or(Value::String(String::new())))
                        .collect()
                })
                .collect();
            (headers, rows)
        }
        Value::Object(map) if !map.is_empty() && map.values().all(Value::is_object) => {
            let mut sub_keys: Vec<String> = Vec::new();
            for inner in map.values().filter_map(Value::as_object) {
                for key in inner.keys() {
                    if !sub_keys.contains(key) {
                        sub_keys.push(key.clone());
                    }
                }
            }
            let mut headers = vec!["Category".to_string()];
            headers.extend(sub_keys.iter().cloned());
            let rows = map
                .iter()
                .map(|(category, inner)| {
                    let mut row = vec![Value::String(category.clone())];
                    row.extend(
                        sub_keys
                            .iter()
                            .map(|k| inner.get(k).cloned().unwrap_or(Value::String(String::new()))),
                    );
                    row
                })
                .collect();
            (headers, rows)
        }
        Value::Object(map) => (
            vec!["Category".to_string(), "Value".to_string()],
            map.iter()
                .map(|(k, v)| vec![Value::String(k.clone()), v.clone()])
                .collect(),
        ),
        Value::Array(items) => match items.first() {
            Some(Value::Object(first)) => {
                let headers: Vec<String> = first.keys().cloned().collect();
                let rows = items
                    .iter()
                    .map(|item| {
                        headers
                            .iter()
                            .map(|h| item.get(h).cloned().unwrap_or(Value::String(String::new())))
                            .collect()
                    })
                    .collect();
                (headers, rows)
            }
            Some(Value::Array(first)) => (
                first.iter().map(label).collect(),
                items[1..].iter().map(as_row).collect(),
            ),
            Some(_) => (
                vec!["#".to_string(), "Value".to_string()],
                items
                    .iter()
                    .enumerate()
                    .map(|(i, v)| vec![json!(i + 1), v.clone()])
                    .collect(),
            ),
            None => (Vec::new(), Vec::new()),
        },
        other => (vec!["Data".to_string()], vec![vec![Value::String(label(other))]]),
    };
    Ok(table)
}

/// Zero-based column index to letters: 0 -> A, 26 -> AA.
pub fn column_name(mut index: usize) -> String {
    let mut name = Vec::new();
    loop {
        name.push(b'A' + (index % 26) as u8);
        if index < 26 {
            break;
        }
        index = index / 26 - 1;
    }
    name.reverse();
    String::from_utf8_lossy(&name).into_owned()
}

/// `"B3"` to zero-based `(column, row)`. `$` anchors are ignored.
pub fn parse_cell_ref(reference: &str) -> Option<(usize, usize)> {
    let reference = reference.trim().replace('$', "").to_uppercase();
    let split = reference.find(|c: char| c.is_ascii_digit())?;
    let (letters, digits) = reference.split_at(split);
    if letters.is_empty() || letters.len() > 3 || !letters.chars().all(|c| c.is_ascii_uppercase()) {
        return None;
    }
    let row: usize = digits.parse().ok()?;
    if row == 0 {
        return None;
    }
    let col = letters
        .bytes()
        .fold(0usize, |acc, b| acc * 26 + (b - b'A' + 1) as usize);
    Some((col - 1, row - 1))
}

fn with_xlsx_extension(path: PathBuf) -> PathBuf {
    if path.extension().is_some() {
        path
    } else {
        path.with_extension("xlsx")
    }
}

fn require_workbook(path: &Path) -> anyhow::Result<Workbook> {
    if !path.exists() {
        return Err(anyhow::anyhow!("Not found: {}", path.display()));
    }
    Workbook::load(path)
}

/// Create a workbook from tabular data.
pub struct CreateExcel;

#[async_trait]
impl Tool for CreateExcel {
    fn name(&self) -> ToolName {
        ToolName::CreateExcel
    }

    async fn execute(&self, args: &Arguments, ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let path = with_xlsx_extension(ctx.path_arg(args, "path")?);
        let data = args
            .get("data")
            .ok_or_else(|| anyhow::anyhow!("Missing 'data' argument"))?;
        let sheet_name = opt_str_arg(args, "sheet_name").unwrap_or("Sheet1");

        let workbook = Workbook::from_data(data, sheet_name)?;
        workbook.save(&path)?;

        let sheet = &workbook.sheets[0];
        let data_rows = sheet.data_row_count().saturating_sub(1);
        tracing::debug!("Wrote workbook {} ({} data rows)", path.display(), data_rows);

        Ok(ToolOutput::new(format!(
            "Excel created: {} ({} rows x {} cols)",
            path.display(),
            data_rows,
            sheet.width()
        ))
        .with_file(path))
    }
}

/// Set one cell of an existing workbook.
pub struct EditExcel;

#[async_trait]
impl Tool for EditExcel {
    fn name(&self) -> ToolName {
        ToolName::EditExcel
    }

    async fn execute(&self, args: &Arguments, ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let path = ctx.path_arg(args, "path")?;
        let cell = str_arg(args, "cell")?;
        let value = args.get("value").cloned().unwrap_or(Value::Null);

        let mut workbook = require_workbook(&path)?;
        let sheet = workbook
            .sheet_mut(opt_str_arg(args, "sheet_name"))
            .ok_or_else(|| anyhow::anyhow!("Workbook has no sheets"))?;
        sheet.set(cell, CellValue::from_json(&value))?;
        let sheet_name = sheet.name.clone();
        workbook.save(&path)?;

        Ok(ToolOutput::new(format!(
            "Set {}!{}={} in {}",
            sheet_name,
            cell.trim().to_uppercase(),
            value,
            path.display()
        )))
    }
}

/// Attach a chart over a sheet's data.
pub struct AddExcelChart;

#[async_trait]
impl Tool for AddExcelChart {
    fn name(&self) -> ToolName {
        ToolName::AddExcelChart
    }

    async fn execute(&self, args: &Arguments, ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let path = ctx.path_arg(args, "path")?;
        let kind = SheetChartKind::parse(opt_str_arg(args, "chart_type").unwrap_or("bar"));
        let title = opt_str_arg(args, "title").unwrap_or("Chart").to_string();

        let mut workbook = require_workbook(&path)?;
        let sheet = workbook
            .sheet_mut(opt_str_arg(args, "sheet_name"))
            .ok_or_else(|| anyhow::anyhow!("Workbook has no sheets"))?;
        if sheet.data_row_count() < 2 || sheet.width() < 2 {
            return Err(anyhow::anyhow!("Not enough data for a chart"));
        }
        sheet.chart = Some(SheetChart {
            kind,
            title: title.clone(),
        });
        workbook.save(&path)?;

        Ok(ToolOutput::new(format!(
            "Chart '{}' ({}) added to {}",
            title,
            kind.as_str(),
            path.display()
        )))
    }
}

/// Read every row of a sheet.
pub struct ReadExcel;

#[async_trait]
impl Tool for ReadExcel {
    fn name(&self) -> ToolName {
        ToolName::ReadExcel
    }

    async fn execute(&self, args: &Arguments, ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let path = ctx.path_arg(args, "path")?;
        let workbook = require_workbook(&path)?;
        let sheet = workbook
            .sheet(opt_str_arg(args, "sheet_name"))
            .ok_or_else(|| anyhow::anyhow!("Workbook has no sheets"))?;

        let width = sheet.width();
        let rows: Vec<Value> = sheet
            .rows
            .iter()
            .map(|r| {
                let mut cells: Vec<Value> = r.iter().map(CellValue::to_json).collect();
                cells.resize(width, Value::Null);
                Value::Array(cells)
            })
            .collect();

        Ok(ToolOutput::new(format!("Read {} rows from {}", rows.len(), sheet.name))
            .with_data(Value::Array(rows)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::testing::{args, context};
    use tempfile::tempdir;

    #[test]
    fn test_cell_references() {
        assert_eq!(column_name(0), "A");
        assert_eq!(column_name(25), "Z");
        assert_eq!(column_name(26), "AA");
        assert_eq!(column_name(701), "ZZ");
        assert_eq!(parse_cell_ref("b3"), Some((1, 2)));
        assert_eq!(parse_cell_ref("$AA$10"), Some((26, 9)));
        assert_eq!(parse_cell_ref("A0"), None);
        assert_eq!(parse_cell_ref("3B"), None);
    }

    #[test]
    fn test_budget_table_gets_total_row() {
        let data = json!({"headers": ["Category", "Amount"], "rows": [["Food", 800], ["Transport", "300"], ["Bills", 1200]]});
        let workbook = Workbook::from_data(&data, "Budget").unwrap();
        let sheet = &workbook.sheets[0];

        assert_eq!(sheet.rows.len(), 5);
        assert_eq!(sheet.get("B3"), Some(&CellValue::Number(300.0)));
        assert_eq!(sheet.get("A5"), Some(&CellValue::Text("TOTAL".into())));
        assert_eq!(sheet.get("B5"), Some(&CellValue::Formula("SUM(B2:B4)".into())));
        assert_eq!(sheet.data_row_count(), 4);
    }

    #[test]
    fn test_data_shapes() {
        let (h, r) = table_from_data(&json!([{"name": "a", "qty": 1}, {"name": "b"}])).unwrap();
        assert_eq!(h, vec!["name", "qty"]);
        assert_eq!(r[1], vec![json!("b"), json!("")]);

        let (h, r) = table_from_data(&json!({"Jan": 10, "Feb": 20})).unwrap();
        assert_eq!(h, vec!["Category", "Value"]);
        assert_eq!(r.len(), 2);

        let (h, r) = table_from_data(&json!({"x": [1, 2, 3], "y": [4]})).unwrap();
        assert_eq!(h, vec!["x", "y"]);
        assert_eq!(r[2], vec![json!(3), json!("")]);

        let (h, _) = table_from_data(&json!({"Q1": {"sales": 1}, "Q2": {"costs": 2}})).unwrap();
        assert_eq!(h, vec!["Category", "sales", "costs"]);

        let (h, r) = table_from_data(&json!([5, 6])).unwrap();
        assert_eq!(h, vec!["#", "Value"]);
        assert_eq!(r[1], vec![json!(2), json!(6)]);

        let (h, _) = table_from_data(&json!("{\"headers\":[\"a\"],\"rows\":[[1]]}")).unwrap();
        assert_eq!(h, vec!["a"]);
    }

    #[test]
    fn test_workbook_survives_save_and_load() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("budget.xlsx");
        let data = json!({"headers": ["Item", "Cost", "Note"], "rows": [["Rent & bills", 1200.5, "<monthly>"], ["Food", 800, true]]});
        let mut workbook = Workbook::from_data(&data, "Budget").unwrap();
        workbook.sheets[0].chart = Some(SheetChart {
            kind: SheetChartKind::Pie,
            title: "Costs".into(),
        });
        workbook.save(&path).unwrap();

        let loaded = Workbook::load(&path).unwrap();
        assert_eq!(loaded, workbook);
    }

    #[tokio::test]
    async fn test_excel_tools_end_to_end() {
        let temp = tempdir().unwrap();
        let ctx = context(temp.path());
        let path = temp.path().join("Documents/budget");
        let p = path.to_str().unwrap();

        let out = CreateExcel
            .execute(
                &args(json!({"path": p, "data": {"headers": ["Category", "Amount"], "rows": [["Food", 800], ["Bills", 1200]]}})),
                &ctx,
            )
            .await
            .unwrap();
        let xlsx = temp.path().join("Documents/budget.xlsx");
        assert_eq!(out.files_created, vec![xlsx.clone()]);
        let x = xlsx.to_str().unwrap();

        EditExcel
            .execute(&args(json!({"path": x, "cell": "b2", "value": 850})), &ctx)
            .await
            .unwrap();
        AddExcelChart
            .execute(&args(json!({"path": x, "chart_type": "line", "title": "Budget"})), &ctx)
            .await
            .unwrap();

        let out = ReadExcel.execute(&args(json!({"path": x})), &ctx).await.unwrap();
        assert_eq!(
            out.data,
            json!([["Category", "Amount"], ["Food", 850], ["Bills", 1200], ["TOTAL", "=SUM(B2:B3)"]])
        );

        let loaded = Workbook::load(&xlsx).unwrap();
        assert_eq!(
            loaded.sheets[0].chart,
            Some(SheetChart {
                kind: SheetChartKind::Line,
                title: "Budget".into()
            })
        );
    }

    #[tokio::test]
    async fn test_chart_needs_data() {
        let temp = tempdir().unwrap();
        let ctx = context(temp.path());
        let path = temp.path().join("one.xlsx");
        Workbook::from_data(&json!([["only"]]), "S").unwrap().save(&path).unwrap();

        let err = AddExcelChart
            .execute(&args(json!({"path": path.to_str().unwrap()})), &ctx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Not enough data"));
    }

    #[test]
    fn test_reads_shared_strings() {
        let parts: HashMap<String, String> = [
            (
                "xl/workbook.xml".to_string(),
                r#"<workbook><sheets><sheet name="Data" sheetId="1" r:id="rId1"/></sheets></workbook>"#.to_string(),
            ),
            (
                "xl/_rels/workbook.xml.rels".to_string(),
                r#"<Relationships><Relationship Id="rId1" Type="x" Target="worksheets/sheet1.xml"/></Relationships>"#.to_string(),
            ),
            (
                "xl/sharedStrings.xml".to_string(),
                r#"<sst><si><t>Name</t></si><si><r><t>Jo</t></r><r><t xml:space="preserve">hn</t></r></si></sst>"#.to_string(),
            ),
            (
                "xl/worksheets/sheet1.xml".to_string(),
                r#"<worksheet><sheetData><row r="1"><c r="A1" t="s"><v>0</v></c></row><row r="2"><c r="A2" t="s"><v>1</v></c><c r="C2"><v>2.5</v></c></row></sheetData></worksheet>"#.to_string(),
            ),
        ]
        .into_iter()
        .collect();

        let workbook = parse_workbook(&parts).unwrap();
        let sheet = workbook.sheet(Some("data")).unwrap();
        assert_eq!(sheet.get("A2"), Some(&CellValue::Text("John".into())));
        assert_eq!(sheet.get("C2"), Some(&CellValue::Number(2.5)));
        assert_eq!(sheet.width(), 3);
    }
}
