use serde::{Deserialize, Serialize};

/// Machine-readable index of one section. Extra provider fields (patterns,
/// cross references, ...) are kept in the per-section file but ignored here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SectionIndex {
    #[serde(default)]
    pub concepts: Vec<IndexEntry>,
    #[serde(default)]
    pub terms: Vec<IndexEntry>,
    #[serde(default)]
    pub topics: Vec<IndexEntry>,
}

/// An index entry is a bare label, an object describing it, or any other JSON
/// value the provider emitted (labelled by its compact JSON).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IndexEntry {
    Label(String),
    Detailed(serde_json::Map<String, serde_json::Value>),
    Other(serde_json::Value),
}

impl IndexEntry {
    pub fn label(&self) -> String {
        match self {
            Self::Label(label) => label.clone(),
            Self::Detailed(fields) => ["name", "term", "category", "title", "topic"]
                .iter()
                .find_map(|key| fields.get(*key).and_then(|v| v.as_str()))
                .map(str::to_owned)
                .unwrap_or_else(|| serde_json::Value::Object(fields.clone()).to_string()),
            Self::Other(value) => value.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterIndexSection {
    pub name: String,
    pub title: String,
    pub index_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterIndex {
    pub generated_at: String,
    pub source: String,
    pub title: String,
    pub sections: Vec<MasterIndexSection>,
    pub all_concepts: Vec<String>,
    pub all_terms: Vec<String>,
    pub all_topics: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_accepts_labels_objects_and_missing_lists() -> anyhow::Result<()> {
        let index: SectionIndex = serde_json::from_str(
            r#"{
                "section": "intro",
                "concepts": ["Color wheel", {"name": "Hue", "relevance": "high"}],
                "terms": [{"term": "LUT", "definition": "lookup table"}],
                "patterns": {"how_to": []}
            }"#,
        )?;
        let concepts = index.concepts.iter().map(IndexEntry::label).collect::<Vec<_>>();
        assert_eq!(concepts, vec!["Color wheel", "Hue"]);
        assert_eq!(index.terms[0].label(), "LUT");
        assert!(index.topics.is_empty());
        Ok(())
    }

    #[test]
    fn scalar_entries_do_not_reject_the_index() -> anyhow::Result<()> {
        let index: SectionIndex =
            serde_json::from_str(r#"{"concepts": ["Hue", 42, true, ["a", "b"]], "terms": [null]}"#)?;
        let concepts = index.concepts.iter().map(IndexEntry::label).collect::<Vec<_>>();
        assert_eq!(concepts, vec!["Hue", "42", "true", r#"["a","b"]"#]);
        assert_eq!(index.terms[0].label(), "null");
        Ok(())
    }

    #[test]
    fn unlabeled_object_falls_back_to_json() {
        let entry: IndexEntry = serde_json::from_str(r#"{"weight": 3}"#).expect("entry");
        assert_eq!(entry.label(), r#"{"weight":3}"#);
    }
}
