//! The active session identifier
//!
//! The companion-side relay is the single place session ids are minted.
//! Viewers never ask the registry; they discover sessions by watching the
//! store for new keys under `sessions/`.

use std::sync::Mutex;

use uuid::Uuid;

#[derive(Default)]
pub struct SessionRegistry {
    current: Mutex<Option<String>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume with an id remembered from a previous run.
    pub fn with_id(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            current: Mutex::new(if id.is_empty() { None } else { Some(id) }),
        }
    }

    /// The remembered id, minting a fresh UUID v4 on first use.
    pub fn current_or_new_id(&self) -> String {
        let mut guard = match self.current.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard
            .get_or_insert_with(|| {
                let id = Uuid::new_v4().to_string();
                log::info!("[SessionRegistry] Started session {}", id);
                id
            })
            .clone()
    }

    /// The remembered id, if any, without minting one.
    pub fn current(&self) -> Option<String> {
        self.current.lock().ok().and_then(|guard| guard.clone())
    }

    /// Forget the current id so the next workout gets a new one.
    pub fn reset(&self) {
        if let Ok(mut guard) = self.current.lock() {
            if let Some(id) = guard.take() {
                log::info!("[SessionRegistry] Ended session {}", id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_or_new_id_is_stable() {
        let registry = SessionRegistry::new();
        let first = registry.current_or_new_id();
        let second = registry.current_or_new_id();
        assert_eq!(first, second);
        assert!(!first.is_empty());
        assert!(Uuid::parse_str(&first).is_ok());
    }

    #[test]
    fn test_reset_mints_new_id() {
        let registry = SessionRegistry::new();
        assert_eq!(registry.current(), None);
        let first = registry.current_or_new_id();
        registry.reset();
        assert_eq!(registry.current(), None);
        let second = registry.current_or_new_id();
        assert_ne!(first, second);
    }

    #[test]
    fn test_with_id_resumes() {
        let registry = SessionRegistry::with_id("resumed-session");
        assert_eq!(registry.current_or_new_id(), "resumed-session");

        let empty = SessionRegistry::with_id("");
        assert_eq!(empty.current(), None);
    }

    #[test]
    fn test_concurrent_callers_agree() {
        let registry = std::sync::Arc::new(SessionRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let r = std::sync::Arc::clone(&registry);
                std::thread::spawn(move || r.current_or_new_id())
            })
            .collect();
        let ids: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
    }
}
