//! Subject catalog

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A subject a student can subscribe to (static catalog entity)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Subject {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    /// Hex color used by the client for badges
    pub color: String,
    pub slug: String,
    /// Whether the subject is part of the maturità exam
    pub maturita: bool,
    pub order_index: i32,
}

/// The full subject catalog, kept sorted by `order_index`
#[derive(Debug, Clone, Default)]
pub struct SubjectCatalog {
    subjects: Vec<Subject>,
}

impl SubjectCatalog {
    pub fn new(mut subjects: Vec<Subject>) -> Self {
        subjects.sort_by(|a, b| {
            a.order_index
                .cmp(&b.order_index)
                .then_with(|| a.name.cmp(&b.name))
        });
        Self { subjects }
    }

    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.subjects.iter().any(|s| s.id == id)
    }

    pub fn get(&self, id: Uuid) -> Option<&Subject> {
        self.subjects.iter().find(|s| s.id == id)
    }

    /// Ids from `ids` that are not in the catalog
    pub fn unknown_ids<'a>(&self, ids: impl IntoIterator<Item = &'a Uuid>) -> Vec<Uuid> {
        ids.into_iter()
            .copied()
            .filter(|id| !self.contains(*id))
            .collect()
    }

    /// Resolve ids to subjects in catalog order, skipping unknown ids
    pub fn resolve(&self, ids: &BTreeSet<Uuid>) -> Vec<Subject> {
        self.subjects
            .iter()
            .filter(|s| ids.contains(&s.id))
            .cloned()
            .collect()
    }

    /// All subjects, optionally filtered by the maturità flag
    pub fn list(&self, maturita: Option<bool>) -> Vec<Subject> {
        self.subjects
            .iter()
            .filter(|s| maturita.map_or(true, |flag| s.maturita == flag))
            .cloned()
            .collect()
    }

    pub fn into_inner(self) -> Vec<Subject> {
        self.subjects
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject(name: &str, order_index: i32, maturita: bool) -> Subject {
        Subject {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: None,
            color: "#3366ff".to_string(),
            slug: name.to_lowercase(),
            maturita,
            order_index,
        }
    }

    #[test]
    fn test_catalog_sorted_by_order_index() {
        let catalog = SubjectCatalog::new(vec![
            subject("Fisica", 2, true),
            subject("Italiano", 0, true),
            subject("Matematica", 1, true),
        ]);

        let names: Vec<_> = catalog.list(None).into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["Italiano", "Matematica", "Fisica"]);
    }

    #[test]
    fn test_list_filters_maturita_flag() {
        let catalog = SubjectCatalog::new(vec![
            subject("Italiano", 0, true),
            subject("Informatica", 1, false),
        ]);

        assert_eq!(catalog.list(Some(true)).len(), 1);
        assert_eq!(catalog.list(Some(false))[0].name, "Informatica");
        assert_eq!(catalog.list(None).len(), 2);
    }

    #[test]
    fn test_unknown_ids_and_resolve() {
        let italiano = subject("Italiano", 0, true);
        let latino = subject("Latino", 1, true);
        let catalog = SubjectCatalog::new(vec![italiano.clone(), latino.clone()]);

        let stranger = Uuid::new_v4();
        let ids: BTreeSet<Uuid> = [latino.id, stranger, italiano.id].into_iter().collect();

        assert_eq!(catalog.unknown_ids(&ids), vec![stranger]);

        let resolved = catalog.resolve(&ids);
        assert_eq!(resolved, vec![italiano, latino]);
    }

    #[test]
    fn test_subject_serialization() {
        let s = subject("Storia", 3, true);
        let json = serde_json::to_string(&s).expect("Failed to serialize");
        assert!(json.contains("\"slug\":\"storia\""));
        assert!(json.contains("\"maturita\":true"));
    }
}
