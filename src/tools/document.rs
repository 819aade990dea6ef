//! Word documents written as minimal `.docx` packages.

use async_trait::async_trait;
use serde_json::Value;

use super::package::{write_package, xml_escape};
use super::{Arguments, Tool, ToolContext, ToolName, ToolOutput};

/// One block of document content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    Title(String),
    Heading(u8, String),
    Paragraph(String),
    Bullet(String),
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Lines of markdown-like text: `#`..`###` headings, `- ` bullets, the rest paragraphs.
fn blocks_from_text(text: &str) -> Vec<Block> {
    let mut blocks = Vec::new();
    for line in text.lines() {
        let block = if let Some(h) = line.strip_prefix("### ") {
            Block::Heading(3, h.trim().to_string())
        } else if let Some(h) = line.strip_prefix("## ") {
            Block::Heading(2, h.trim().to_string())
        } else if let Some(h) = line.strip_prefix("# ") {
            Block::Heading(1, h.trim().to_string())
        } else if let Some(b) = line.strip_prefix("- ").or_else(|| line.strip_prefix("* ")) {
            Block::Bullet(b.trim().to_string())
        } else if line.trim().is_empty() {
            continue;
        } else {
            Block::Paragraph(line.to_string())
        };
        blocks.push(block);
    }
    blocks
}

/// Document content from a string, `{title, sections}` or a list of paragraphs.
pub fn blocks_from_content(content: &Value) -> Vec<Block> {
    match content {
        Value::String(s) => blocks_from_text(s),
        Value::Object(map) => {
            let mut blocks = Vec::new();
            if let Some(title) = map.get("title") {
                blocks.push(Block::Title(scalar_text(title)));
            }
            for section in map.get("sections").and_then(Value::as_array).into_iter().flatten() {
                match section {
                    Value::Object(sec) => {
                        if let Some(h) = sec.get("heading") {
                            blocks.push(Block::Heading(1, scalar_text(h)));
                        }
                        if let Some(t) = sec.get("text") {
                            blocks.extend(
                                scalar_text(t)
                                    .lines()
                                    .filter(|l| !l.trim().is_empty())
                                    .map(|l| Block::Paragraph(l.to_string())),
                            );
                        }
                        for b in sec.get("bullets").and_then(Value::as_array).into_iter().flatten() {
                            blocks.push(Block::Bullet(scalar_text(b)));
                        }
                    }
                    other => blocks.push(Block::Paragraph(scalar_text(other))),
                }
            }
            if let Some(Value::String(body)) = map.get("content").or_else(|| map.get("text")) {
                blocks.extend(blocks_from_text(body));
            }
            blocks
        }
        Value::Array(items) => items.iter().map(|i| Block::Paragraph(scalar_text(i))).collect(),
        Value::Null => Vec::new(),
        other => vec![Block::Paragraph(scalar_text(other))],
    }
}

fn paragraph(style: Option<&str>, text: &str) -> String {
    let props = match style {
        Some("ListBullet") => {
            r#"<w:pPr><w:pStyle w:val="ListBullet"/><w:numPr><w:ilvl w:val="0"/><w:numId w:val="1"/></w:numPr></w:pPr>"#.to_string()
        }
        Some(style) => format!(r#"<w:pPr><w:pStyle w:val="{}"/></w:pPr>"#, style),
        None => String::new(),
    };
    format!(
        r#"<w:p>{}<w:r><w:t xml:space="preserve">{}</w:t></w:r></w:p>"#,
        props,
        xml_escape(text)
    )
}

fn document_xml(blocks: &[Block]) -> String {
    let body: String = blocks
        .iter()
        .map(|block| match block {
            Block::Title(t) => paragraph(Some("Title"), t),
            Block::Heading(level, t) => paragraph(Some(&format!("Heading{}", level)), t),
            Block::Paragraph(t) => paragraph(None, t),
            Block::Bullet(t) => paragraph(Some("ListBullet"), t),
        })
        .collect();
    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><w:body>{}<w:sectPr><w:pgSz w:w="11906" w:h="16838"/><w:pgMar w:top="1440" w:right="1440" w:bottom="1440" w:left="1440" w:header="708" w:footer="708" w:gutter="0"/></w:sectPr></w:body></w:document>"#,
        body
    )
}

fn heading_style(id: &str, name: &str, size: u32, colour: &str, outline: Option<u8>) -> String {
    let outline = outline
        .map(|l| format!(r#"<w:outlineLvl w:val="{}"/>"#, l))
        .unwrap_or_default();
    format!(
        r#"<w:style w:type="paragraph" w:styleId="{id}"><w:name w:val="{name}"/><w:basedOn w:val="Normal"/><w:next w:val="Normal"/><w:qFormat/><w:pPr><w:keepNext/><w:spacing w:before="240" w:after="120"/>{outline}</w:pPr><w:rPr><w:b/><w:color w:val="{colour}"/><w:sz w:val="{size}"/></w:rPr></w:style>"#
    )
}

fn styles_xml() -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><w:styles xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:docDefaults><w:rPrDefault><w:rPr><w:rFonts w:ascii="Calibri" w:hAnsi="Calibri" w:cs="Calibri"/><w:sz w:val="22"/></w:rPr></w:rPrDefault><w:pPrDefault><w:pPr><w:spacing w:after="160" w:line="259" w:lineRule="auto"/></w:pPr></w:pPrDefault></w:docDefaults><w:style w:type="paragraph" w:default="1" w:styleId="Normal"><w:name w:val="Normal"/><w:qFormat/></w:style>{}{}{}{}<w:style w:type="paragraph" w:styleId="ListBullet"><w:name w:val="List Bullet"/><w:basedOn w:val="Normal"/><w:pPr><w:ind w:left="720" w:hanging="360"/></w:pPr></w:style></w:styles>"#,
        heading_style("Title", "Title", 56, "17365D", None),
        heading_style("Heading1", "heading 1", 32, "2F5496", Some(0)),
        heading_style("Heading2", "heading 2", 26, "2F5496", Some(1)),
        heading_style("Heading3", "heading 3", 24, "1F3763", Some(2)),
    )
}

const NUMBERING_XML: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><w:numbering xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:abstractNum w:abstractNumId="0"><w:lvl w:ilvl="0"><w:start w:val="1"/><w:numFmt w:val="bullet"/><w:lvlText w:val="•"/><w:lvlJc w:val="left"/><w:pPr><w:ind w:left="720" w:hanging="360"/></w:pPr></w:lvl></w:abstractNum><w:num w:numId="1"><w:abstractNumId w:val="0"/></w:num></w:numbering>"#;

fn docx_parts(blocks: &[Block]) -> Vec<(String, String)> {
    vec![
        (
            "[Content_Types].xml".to_string(),
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/word/document.xml" ContentType="application/vnd.openxmlformats-officedocument.wordprocessingml.document.main+xml"/><Override PartName="/word/styles.xml" ContentType="application/vnd.openxmlformats-officedocument.wordprocessingml.styles+xml"/><Override PartName="/word/numbering.xml" ContentType="application/vnd.openxmlformats-officedocument.wordprocessingml.numbering+xml"/></Types>"#.to_string(),
        ),
        (
            "_rels/.rels".to_string(),
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="word/document.xml"/></Relationships>"#.to_string(),
        ),
        (
            "word/_rels/document.xml.rels".to_string(),
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/styles" Target="styles.xml"/><Relationship Id="rId2" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/numbering" Target="numbering.xml"/></Relationships>"#.to_string(),
        ),
        ("word/document.xml".to_string(), document_xml(blocks)),
        ("word/styles.xml".to_string(), styles_xml()),
        ("word/numbering.xml".to_string(), NUMBERING_XML.to_string()),
    ]
}

pub struct CreateWordDocument;

#[async_trait]
impl Tool for CreateWordDocument {
    fn name(&self) -> ToolName {
        ToolName::CreateWordDocument
    }

    async fn execute(&self, args: &Arguments, ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let mut path = ctx.path_arg(args, "path")?;
        if path.extension().is_none() {
            path.set_extension("docx");
        }
        let content = args
            .get("content")
            .ok_or_else(|| anyhow::anyhow!("Missing 'content' argument"))?;

        let blocks = blocks_from_content(content);
        write_package(&path, &docx_parts(&blocks))?;

        Ok(ToolOutput::new(format!(
            "Word document: {} ({} blocks)",
            path.display(),
            blocks.len()
        ))
        .with_file(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::package::read_package;
    use crate::tools::testing::{args, context};
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_markdown_lines() {
        let blocks = blocks_from_content(&json!("# Report\n\n## Costs\nFood is 800\n- rent\n### Notes"));
        assert_eq!(
            blocks,
            vec![
                Block::Heading(1, "Report".into()),
                Block::Heading(2, "Costs".into()),
                Block::Paragraph("Food is 800".into()),
                Block::Bullet("rent".into()),
                Block::Heading(3, "Notes".into()),
            ]
        );
    }

    #[test]
    fn test_sections() {
        let blocks = blocks_from_content(&json!({
            "title": "Plan",
            "sections": [{"heading": "Goals", "text": "Ship it", "bullets": ["fast", "safe"]}]
        }));
        assert_eq!(blocks[0], Block::Title("Plan".into()));
        assert_eq!(blocks[1], Block::Heading(1, "Goals".into()));
        assert_eq!(blocks.len(), 5);

        let blocks = blocks_from_content(&json!(["one", 2]));
        assert_eq!(blocks[1], Block::Paragraph("2".into()));
    }

    #[tokio::test]
    async fn test_document_package() {
        let temp = tempdir().unwrap();
        let ctx = context(temp.path());
        let target = temp.path().join("Documents/report");

        let out = CreateWordDocument
            .execute(
                &args(json!({"path": target.to_str().unwrap(), "content": "# Q&A\n- point"})),
                &ctx,
            )
            .await
            .unwrap();
        let path = temp.path().join("Documents/report.docx");
        assert_eq!(out.files_created, vec![path.clone()]);

        let parts = read_package(&path).unwrap();
        let document = &parts["word/document.xml"];
        assert!(document.contains(r#"<w:pStyle w:val="Heading1"/></w:pPr><w:r><w:t xml:space="preserve">Q&amp;A</w:t>"#));
        assert!(document.contains(r#"<w:numId w:val="1"/>"#));
        assert!(parts["word/styles.xml"].contains(r#"w:styleId="ListBullet""#));
    }
}
