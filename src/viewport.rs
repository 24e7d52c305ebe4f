use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

/// A named device-class screen size used to drive a render session.
///
/// Profiles are immutable configuration: they are loaded once into a
/// [`ViewportSet`] and referenced by name from job requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewportProfile {
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// How far (in px) a session may nudge the scroll position to trigger
    /// lazily-loaded content. Never exceeds the viewport height.
    pub scroll_tolerance_px: u32,
}

impl ViewportProfile {
    pub fn new(name: impl Into<String>, width: u32, height: u32, scroll_tolerance_px: u32) -> Self {
        Self {
            name: name.into(),
            width,
            height,
            scroll_tolerance_px,
        }
    }
}

/// The set of viewport profiles known to the engine.
///
/// Lookup is by name, case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewportSet {
    profiles: Vec<ViewportProfile>,
}

impl ViewportSet {
    pub fn new(profiles: Vec<ViewportProfile>) -> Self {
        Self { profiles }
    }

    /// The builtin device classes: desktop 1440×900, tablet 1024×768,
    /// mobile 390×844.
    pub fn builtin() -> Self {
        Self::new(vec![
            ViewportProfile::new("desktop", 1440, 900, 200),
            ViewportProfile::new("tablet", 1024, 768, 200),
            ViewportProfile::new("mobile", 390, 844, 120),
        ])
    }

    /// Resolve a profile by name. Fails with [`EngineError::UnknownViewport`]
    /// when the name is not configured.
    pub fn resolve(&self, name: &str) -> Result<&ViewportProfile, EngineError> {
        self.profiles
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| EngineError::UnknownViewport(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.profiles.iter().map(|p| p.name.as_str())
    }
}

impl Default for ViewportSet {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_builtin_profiles() {
        let set = ViewportSet::builtin();
        let desktop = set.resolve("desktop").unwrap();
        assert_eq!(desktop.width, 1440);
        assert_eq!(desktop.height, 900);
        let mobile = set.resolve("mobile").unwrap();
        assert_eq!((mobile.width, mobile.height), (390, 844));
    }

    #[test]
    fn resolve_is_case_insensitive() {
        let set = ViewportSet::builtin();
        assert_eq!(set.resolve("Desktop").unwrap().name, "desktop");
    }

    #[test]
    fn resolve_unknown_profile_fails() {
        let set = ViewportSet::builtin();
        match set.resolve("watch") {
            Err(EngineError::UnknownViewport(name)) => assert_eq!(name, "watch"),
            other => panic!("expected UnknownViewport, got {:?}", other),
        }
    }
}
