use crate::types::Message;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Words that mark a line as describing the concept itself
pub const CONCEPT_KEYWORDS: &[&str] = &[
    "fabric",
    "material",
    "design",
    "collection",
    "style",
    "trend",
    "season",
    "color",
    "pattern",
    "fit",
    "size",
    "target audience",
    "market",
];

/// Terms whose presence suggests the document really is a concept pitch
const DOMAIN_TERMS: &[&str] = &[
    "fashion", "clothing", "apparel", "design", "collection", "style", "fabric", "material",
    "trend", "season", "wear", "garment",
];

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("concept file not found: {0}")]
    NotFound(PathBuf),

    #[error("unsupported concept file '{path}': expected .txt, .md or .json")]
    Unsupported { path: PathBuf },

    #[error("failed to read {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid concept JSON in {path}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("concept document is empty")]
    Empty,
}

/// Text extracted from a submitted concept, plus what could be recognised in it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptDocument {
    #[serde(default = "default_title")]
    pub title: String,
    pub text: String,
    #[serde(default)]
    pub structured_elements: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

fn default_title() -> String {
    "Untitled Concept".to_string()
}

impl ConceptDocument {
    /// Build a document from free text. Headings and bullet items become
    /// structured elements.
    pub fn from_text(title: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        let structured_elements = text
            .lines()
            .filter_map(structured_line)
            .map(str::to_string)
            .collect::<Vec<_>>();

        let mut metadata = BTreeMap::new();
        metadata.insert("lines".to_string(), text.lines().count().to_string());
        metadata.insert("characters".to_string(), text.chars().count().to_string());

        Self {
            title: title.into(),
            text,
            structured_elements,
            metadata,
        }
    }

    /// Elements or lines that mention a concept keyword
    pub fn concept_elements(&self) -> Vec<&str> {
        let source: Box<dyn Iterator<Item = &str>> = if self.structured_elements.is_empty() {
            Box::new(self.text.lines())
        } else {
            Box::new(self.structured_elements.iter().map(String::as_str))
        };

        source
            .map(str::trim)
            .filter(|line| !line.is_empty() && mentions_any(line, CONCEPT_KEYWORDS))
            .collect()
    }

    /// How convincingly the text reads as a concept pitch
    pub fn assess(&self) -> ConceptAssessment {
        let lower = self.text.to_lowercase();
        let found_terms: Vec<String> = DOMAIN_TERMS
            .iter()
            .filter(|term| lower.contains(*term))
            .map(|term| term.to_string())
            .collect();

        let mut recommendations = Vec::new();
        if found_terms.is_empty() {
            recommendations.push(
                "The document does not read like a concept pitch; include design, material and market details."
                    .to_string(),
            );
        }
        if self.structured_elements.len() < 5 {
            recommendations.push(
                "The pitch is brief. Consider adding target market, materials and production plans."
                    .to_string(),
            );
        }

        ConceptAssessment {
            is_valid: !found_terms.is_empty(),
            confidence: found_terms.len() as f32 / DOMAIN_TERMS.len() as f32,
            found_terms,
            recommendations,
        }
    }

    pub fn to_message(&self) -> Message {
        Message::Json(serde_json::to_value(self).unwrap_or_default())
    }

    /// Accepts a JSON document or plain text
    pub fn from_message(message: &Message) -> Option<Self> {
        match message {
            Message::Json(value) => serde_json::from_value(value.clone()).ok(),
            Message::Text(text) => Some(Self::from_text(default_title(), text.clone())),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConceptAssessment {
    pub is_valid: bool,
    pub confidence: f32,
    pub found_terms: Vec<String>,
    pub recommendations: Vec<String>,
}

fn structured_line(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    let stripped = trimmed
        .strip_prefix('#')
        .map(|rest| rest.trim_start_matches('#'))
        .or_else(|| trimmed.strip_prefix("- "))
        .or_else(|| trimmed.strip_prefix("* "))
        .or_else(|| {
            let digits = trimmed.chars().take_while(char::is_ascii_digit).count();
            if digits > 0 {
                trimmed[digits..].strip_prefix(". ")
            } else {
                None
            }
        })?;

    let stripped = stripped.trim();
    (!stripped.is_empty()).then_some(stripped)
}

pub(crate) fn mentions_any(text: &str, keywords: &[&str]) -> bool {
    let lower = text.to_lowercase();
    keywords.iter().any(|k| lower.contains(k))
}

/// Turns a submitted file into a `ConceptDocument`
pub trait DocumentParser: Send + Sync {
    fn parse(&self, path: &Path) -> Result<ConceptDocument, IngestError>;
}

/// Parser for `.txt`, `.md` and `.json` concept files
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainTextParser;

impl DocumentParser for PlainTextParser {
    fn parse(&self, path: &Path) -> Result<ConceptDocument, IngestError> {
        if !path.exists() {
            return Err(IngestError::NotFound(path.to_path_buf()));
        }

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();
        if !matches!(extension.as_str(), "txt" | "md" | "json") {
            return Err(IngestError::Unsupported {
                path: path.to_path_buf(),
            });
        }

        let raw = std::fs::read_to_string(path).map_err(|source| IngestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if raw.trim().is_empty() {
            return Err(IngestError::Empty);
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().replace(['_', '-'], " "))
            .unwrap_or_else(default_title);

        let mut document = if extension == "json" {
            let mut document: ConceptDocument =
                serde_json::from_str(&raw).map_err(|source| IngestError::Json {
                    path: path.to_path_buf(),
                    source,
                })?;
            if document.structured_elements.is_empty() {
                document.structured_elements =
                    ConceptDocument::from_text("", document.text.clone()).structured_elements;
            }
            if document.title == default_title() {
                document.title = stem;
            }
            document
        } else {
            let title = raw
                .lines()
                .find_map(|line| line.trim().strip_prefix("# "))
                .map(|t| t.trim().to_string())
                .unwrap_or(stem);
            ConceptDocument::from_text(title, raw)
        };

        if document.text.trim().is_empty() {
            return Err(IngestError::Empty);
        }

        document
            .metadata
            .insert("concept_file_name".to_string(), file_name);
        document
            .metadata
            .insert("element_count".to_string(), document.structured_elements.len().to_string());

        tracing::debug!(
            "Parsed concept '{}' from {} with {} elements",
            document.title,
            path.display(),
            document.structured_elements.len()
        );
        Ok(document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PITCH: &str = "# Coastal Linen Line\n\nA relaxed summer collection.\n\n- Target audience: urban professionals 25-40\n- Fabric: organic linen blend\n* Color palette: sand, sea glass\n1. Price point around 80 dollars\n2. Launch for the spring season\n";

    #[test]
    fn test_from_text_extracts_headings_and_bullets() {
        let doc = ConceptDocument::from_text("Coastal", PITCH);
        assert_eq!(
            doc.structured_elements,
            vec![
                "Coastal Linen Line",
                "Target audience: urban professionals 25-40",
                "Fabric: organic linen blend",
                "Color palette: sand, sea glass",
                "Price point around 80 dollars",
                "Launch for the spring season",
            ]
        );
        assert_eq!(doc.metadata["lines"], "9");

        let elements = doc.concept_elements();
        assert!(elements.contains(&"Fabric: organic linen blend"));
        assert!(!elements.contains(&"Price point around 80 dollars"));
    }

    #[test]
    fn test_assessment() {
        let doc = ConceptDocument::from_text("Coastal", PITCH);
        let assessment = doc.assess();
        assert!(assessment.is_valid);
        assert!(assessment.found_terms.contains(&"collection".to_string()));
        assert!(assessment.recommendations.is_empty());

        let doc = ConceptDocument::from_text("Memo", "Quarterly budget review");
        let assessment = doc.assess();
        assert!(!assessment.is_valid);
        assert_eq!(assessment.recommendations.len(), 2);
    }

    #[test]
    fn test_message_round_trip_and_text_fallback() {
        let doc = ConceptDocument::from_text("Coastal", PITCH);
        assert_eq!(ConceptDocument::from_message(&doc.to_message()), Some(doc));

        let from_text = ConceptDocument::from_message(&Message::text("- Fabric: wool")).unwrap();
        assert_eq!(from_text.title, "Untitled Concept");
        assert_eq!(from_text.structured_elements, vec!["Fabric: wool"]);
    }

    #[test]
    fn test_parse_markdown_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("coastal_linen.md");
        std::fs::write(&path, PITCH).unwrap();

        let doc = PlainTextParser.parse(&path).unwrap();
        assert_eq!(doc.title, "Coastal Linen Line");
        assert_eq!(doc.metadata["concept_file_name"], "coastal_linen.md");
        assert_eq!(doc.metadata["element_count"], "6");
    }

    #[test]
    fn test_parse_json_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("night_market.json");
        std::fs::write(&path, r#"{"text": "- Style: reflective streetwear\n- Market: cyclists"}"#)
            .unwrap();

        let doc = PlainTextParser.parse(&path).unwrap();
        assert_eq!(doc.title, "night market");
        assert_eq!(doc.structured_elements.len(), 2);
    }

    #[test]
    fn test_parse_errors() {
        let temp_dir = TempDir::new().unwrap();

        let missing = temp_dir.path().join("missing.txt");
        assert!(matches!(PlainTextParser.parse(&missing), Err(IngestError::NotFound(_))));

        let deck = temp_dir.path().join("deck.pptx");
        std::fs::write(&deck, "binary").unwrap();
        assert!(matches!(
            PlainTextParser.parse(&deck),
            Err(IngestError::Unsupported { .. })
        ));

        let empty = temp_dir.path().join("empty.txt");
        std::fs::write(&empty, "   \n").unwrap();
        assert!(matches!(PlainTextParser.parse(&empty), Err(IngestError::Empty)));

        let broken = temp_dir.path().join("broken.json");
        std::fs::write(&broken, "{not json").unwrap();
        assert!(matches!(PlainTextParser.parse(&broken), Err(IngestError::Json { .. })));
    }
}
