use crate::model::feature::Feature;
use std::collections::BTreeMap;

/// Target of a write: the space table, and the base table it overlays when
/// the space extends another one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Space {
    pub table: String,
    pub base: Option<String>,
}

impl Space {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            base: None,
        }
    }

    pub fn extending(table: impl Into<String>, base: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            base: Some(base.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModificationFlags {
    /// All-or-nothing execution.
    pub transactional: bool,
    pub enable_global_versioning: bool,
    /// Optimistic concurrency check against the supplied prior uuid.
    pub handle_uuid: bool,
    pub for_extending_space: bool,
    pub include_old_states: bool,
}

#[derive(Debug, Clone)]
pub struct ModificationRequest {
    pub space: Space,
    pub stream_id: Option<String>,
    pub inserts: Vec<Feature>,
    pub updates: Vec<Feature>,
    pub upserts: Vec<Feature>,
    /// id -> expected prior uuid.
    pub deletes: BTreeMap<String, Option<String>>,
    pub flags: ModificationFlags,
    /// Assigned by the version allocator, shared by every row of the request.
    pub version: Option<i64>,
}

impl ModificationRequest {
    pub fn new(space: Space) -> Self {
        Self {
            space,
            stream_id: None,
            inserts: Vec::new(),
            updates: Vec::new(),
            upserts: Vec::new(),
            deletes: BTreeMap::new(),
            flags: ModificationFlags::default(),
            version: None,
        }
    }

    pub fn with_stream_id(mut self, stream_id: impl Into<String>) -> Self {
        self.stream_id = Some(stream_id.into());
        self
    }

    pub fn insert(mut self, feature: Feature) -> Self {
        self.inserts.push(feature);
        self
    }

    pub fn update(mut self, feature: Feature) -> Self {
        self.updates.push(feature);
        self
    }

    pub fn upsert(mut self, feature: Feature) -> Self {
        self.upserts.push(feature);
        self
    }

    pub fn delete(mut self, id: impl Into<String>, puuid: Option<&str>) -> Self {
        self.deletes.insert(id.into(), puuid.map(str::to_string));
        self
    }

    pub fn transactional(mut self, on: bool) -> Self {
        self.flags.transactional = on;
        self
    }

    pub fn versioned(mut self, on: bool) -> Self {
        self.flags.enable_global_versioning = on;
        self
    }

    pub fn handle_uuid(mut self, on: bool) -> Self {
        self.flags.handle_uuid = on;
        self
    }

    pub fn for_extending_space(mut self, on: bool) -> Self {
        self.flags.for_extending_space = on;
        self
    }

    pub fn include_old_states(mut self, on: bool) -> Self {
        self.flags.include_old_states = on;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty()
            && self.updates.is_empty()
            && self.upserts.is_empty()
            && self.deletes.is_empty()
    }

    /// Every id named by the request, in insert, update, upsert, delete order.
    pub fn referenced_ids(&self) -> Vec<String> {
        self.inserts
            .iter()
            .chain(&self.updates)
            .chain(&self.upserts)
            .filter_map(|f| f.id.clone())
            .chain(self.deletes.keys().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{ModificationRequest, Space};
    use crate::model::Feature;

    #[test]
    fn referenced_ids_skip_missing_ids() {
        let request = ModificationRequest::new(Space::new("t"))
            .insert(Feature::new("a"))
            .insert(Feature::without_id())
            .update(Feature::new("b"))
            .upsert(Feature::new("c"))
            .delete("d", None);
        assert_eq!(request.referenced_ids(), vec!["a", "b", "c", "d"]);
        assert!(!request.is_empty());
    }
}
