use serde::{Deserialize, Serialize};

/// Name suffix the environment appends to every instantiated template.
pub const INSTANCE_SUFFIX: &str = " (Clone)";

/// Reference identity of an entity. Allocated monotonically and never reused,
/// so a stale id can never alias a newer entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityId(pub u64);

/// Opaque identifier assigned at authoring time. Preferred over names when
/// matching entities across contexts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StableKey(pub String);

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    #[serde(default)]
    pub position: Vec2,
    #[serde(default)]
    pub rotation_radians: Option<f32>,
}

/// Which container an entity's hierarchy lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Residence {
    /// Owned by the active context; torn down on the next single-mode load.
    Context,
    /// Exempt from context teardown.
    Persistent,
}

#[derive(Debug, Clone)]
pub struct Entity {
    pub id: EntityId,
    pub name: String,
    pub stable_key: Option<StableKey>,
    pub active: bool,
    pub components: Vec<String>,
    pub transform: Transform,
    pub(crate) parent: Option<EntityId>,
    pub(crate) residence: Residence,
}

impl Entity {
    pub fn parent(&self) -> Option<EntityId> {
        self.parent
    }

    pub fn residence(&self) -> Residence {
        self.residence
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn has_component(&self, component: &str) -> bool {
        self.components.iter().any(|candidate| candidate == component)
    }
}

#[derive(Debug, Default)]
pub struct EntityIdAllocator {
    next: u64,
}

impl EntityIdAllocator {
    pub fn allocate(&mut self) -> EntityId {
        let id = EntityId(self.next);
        self.next = self.next.saturating_add(1);
        id
    }
}

/// Authored description of an entity hierarchy, used both for context
/// content and for templates instantiated at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityTemplate {
    pub name: String,
    #[serde(default)]
    pub key: Option<StableKey>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub components: Vec<String>,
    #[serde(default)]
    pub transform: Transform,
    #[serde(default)]
    pub children: Vec<EntityTemplate>,
}

fn default_active() -> bool {
    true
}

impl EntityTemplate {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: None,
            active: true,
            components: Vec::new(),
            transform: Transform::default(),
            children: Vec::new(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(StableKey(key.into()));
        self
    }

    pub fn with_child(mut self, child: EntityTemplate) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_position(mut self, x: f32, y: f32) -> Self {
        self.transform.position = Vec2 { x, y };
        self
    }

    pub fn query(&self) -> EntityQuery {
        EntityQuery {
            name: self.name.clone(),
            key: self.key.clone(),
        }
    }
}

/// Logical identity used to find entities across contexts.
///
/// Matching prefers the stable key when both sides carry one; name matching
/// is a best-effort fallback since unrelated entities can share a name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityQuery {
    pub name: String,
    #[serde(default)]
    pub key: Option<StableKey>,
}

impl EntityQuery {
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: None,
        }
    }

    pub fn matches(&self, entity: &Entity) -> bool {
        match (&self.key, &entity.stable_key) {
            (Some(wanted), Some(actual)) => wanted == actual,
            _ => self.name == entity.name,
        }
    }
}

/// Strips the instancing suffix the environment appends on instantiate.
pub fn normalize_instance_name(name: &str) -> &str {
    let mut normalized = name;
    while let Some(stripped) = normalized.strip_suffix(INSTANCE_SUFFIX) {
        normalized = stripped;
    }
    normalized.trim_end()
}

/// True when two entities share a logical identity.
pub fn same_identity(a: &Entity, b: &Entity) -> bool {
    match (&a.stable_key, &b.stable_key) {
        (Some(left), Some(right)) => left == right,
        _ => a.name == b.name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(name: &str, key: Option<&str>) -> Entity {
        Entity {
            id: EntityId(0),
            name: name.to_string(),
            stable_key: key.map(|key| StableKey(key.to_string())),
            active: true,
            components: Vec::new(),
            transform: Transform::default(),
            parent: None,
            residence: Residence::Context,
        }
    }

    #[test]
    fn allocator_never_reuses_ids() {
        let mut allocator = EntityIdAllocator::default();
        let first = allocator.allocate();
        let second = allocator.allocate();
        let third = allocator.allocate();

        assert_eq!(first.0, 0);
        assert_eq!(second.0, 1);
        assert_eq!(third.0, 2);
    }

    #[test]
    fn normalize_strips_repeated_clone_suffixes() {
        assert_eq!(normalize_instance_name("Desk (Clone)"), "Desk");
        assert_eq!(normalize_instance_name("Desk (Clone) (Clone)"), "Desk");
        assert_eq!(normalize_instance_name("Desk"), "Desk");
    }

    #[test]
    fn query_prefers_stable_key_over_name() {
        let query = EntityQuery {
            name: "Lamp".to_string(),
            key: Some(StableKey("lamp-01".to_string())),
        };

        assert!(query.matches(&entity("Renamed", Some("lamp-01"))));
        assert!(!query.matches(&entity("Lamp", Some("lamp-02"))));
        assert!(query.matches(&entity("Lamp", None)));
    }

    #[test]
    fn same_identity_falls_back_to_name() {
        assert!(same_identity(&entity("Lamp", None), &entity("Lamp", Some("k"))));
        assert!(!same_identity(
            &entity("Lamp", Some("a")),
            &entity("Lamp", Some("b"))
        ));
    }

    #[test]
    fn template_defaults_parse_from_minimal_json() {
        let template: EntityTemplate =
            serde_json::from_str(r#"{ "name": "Desk" }"#).expect("template");
        assert!(template.active);
        assert!(template.children.is_empty());
        assert_eq!(template.query(), EntityQuery::by_name("Desk"));
    }
}
