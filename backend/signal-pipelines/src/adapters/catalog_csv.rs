use crate::error::{PipelineError, Result};
use crate::models::CatalogItem;
use crate::store::CatalogReader;
use artifact_schema::parse_rfc3339;
use async_trait::async_trait;
use std::path::PathBuf;

/// Catalog export in CSV form. Header names are matched case-insensitively;
/// only the item id column is mandatory.
#[derive(Debug, Clone)]
pub struct CsvCatalogReader {
    path: PathBuf,
}

#[derive(Debug, Default)]
struct Columns {
    item_id: usize,
    tags: Option<usize>,
    price: Option<usize>,
    created_at: Option<usize>,
    namespace: Option<usize>,
}

impl Columns {
    fn from_header(header: &[String]) -> Result<Self> {
        let find = |aliases: &[&str]| {
            header
                .iter()
                .position(|h| aliases.contains(&h.trim().to_lowercase().as_str()))
        };
        let item_id = find(&["item_id", "itemid", "id"])
            .ok_or_else(|| PipelineError::validation("catalog csv: missing item_id column"))?;
        Ok(Self {
            item_id,
            tags: find(&["tags", "tag_list"]),
            price: find(&["price"]),
            created_at: find(&["created_at", "createdat"]),
            namespace: find(&["namespace", "surface"]),
        })
    }
}

impl CsvCatalogReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn parse(raw: &str) -> Result<Vec<CatalogItem>> {
        let mut rows = raw.lines().filter(|l| !l.trim().is_empty());
        let Some(header) = rows.next() else {
            return Ok(Vec::new());
        };
        let columns = Columns::from_header(&split_record(header))?;

        let mut items = Vec::new();
        for (idx, line) in rows.enumerate() {
            let record = split_record(line);
            let field = |col: Option<usize>| {
                col.and_then(|c| record.get(c))
                    .map(|v| v.trim())
                    .filter(|v| !v.is_empty())
            };

            let price = match field(columns.price) {
                Some(raw) => Some(raw.parse::<f64>().map_err(|_| {
                    PipelineError::validation(format!("catalog csv line {}: invalid price {:?}", idx + 2, raw))
                })?),
                None => None,
            };
            let created_at = match field(columns.created_at) {
                Some(raw) => Some(parse_rfc3339(raw).map_err(|e| {
                    PipelineError::validation(format!("catalog csv line {}: {}", idx + 2, e))
                })?),
                None => None,
            };

            items.push(CatalogItem {
                item_id: field(Some(columns.item_id)).unwrap_or_default().to_string(),
                namespace: field(columns.namespace).unwrap_or_default().to_string(),
                tags: split_tags(field(columns.tags).unwrap_or_default()),
                price,
                created_at,
            });
        }
        Ok(items)
    }
}

#[async_trait]
impl CatalogReader for CsvCatalogReader {
    async fn read_items(&self) -> Result<Vec<CatalogItem>> {
        let raw = tokio::fs::read_to_string(&self.path).await?;
        Self::parse(&raw)
    }
}

/// Tags separated by `,`, `;` or `|`; trimmed and deduplicated, case kept.
fn split_tags(raw: &str) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for tag in raw.split([',', ';', '|']) {
        let tag = tag.trim();
        if !tag.is_empty() && !tags.iter().any(|t| t == tag) {
            tags.push(tag.to_string());
        }
    }
    tags
}

/// One CSV record: comma separated, double quotes group and `""` escapes.
fn split_record(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = line.trim_end_matches('\r').chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ',' if !quoted => fields.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    fields.push(current);
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aliases_and_quoted_tags() {
        let raw = "ItemID,Tag_List,Price,CreatedAt,Surface\n\
                   sku-1,\"Books; fiction|Books\",12.5,2024-01-01T00:00:00Z,home\n\
                   sku-2,,,,\n";
        let items = CsvCatalogReader::parse(raw).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].item_id, "sku-1");
        assert_eq!(items[0].tags, vec!["Books", "fiction"]);
        assert_eq!(items[0].price, Some(12.5));
        assert!(items[0].created_at.is_some());
        assert_eq!(items[0].namespace, "home");
        assert!(items[1].tags.is_empty());
        assert_eq!(items[1].price, None);
    }

    #[test]
    fn test_missing_item_column() {
        let err = CsvCatalogReader::parse("sku,tags\na,b\n").unwrap_err();
        assert!(err.to_string().contains("item_id"));
    }

    #[test]
    fn test_split_record_escapes() {
        assert_eq!(split_record(r#"a,"b,""c""",d"#), vec!["a", "b,\"c\"", "d"]);
    }
}
