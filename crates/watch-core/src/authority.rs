//! Role capability injected into the sync kernel so it never touches the
//! host's user model directly.

/// Single-arbiter capability: the privileged (GM) client may create the
/// shared store's backing object and write the fallback store.
pub trait AuthorityProvider: Send + Sync {
    fn is_privileged(&self) -> bool;
}

/// Fixed-answer authority for tests and local harnesses.
#[derive(Debug, Clone, Copy)]
pub struct FixedAuthority {
    privileged: bool,
}

impl FixedAuthority {
    pub fn privileged() -> Self {
        Self { privileged: true }
    }

    pub fn player() -> Self {
        Self { privileged: false }
    }
}

impl AuthorityProvider for FixedAuthority {
    fn is_privileged(&self) -> bool {
        self.privileged
    }
}
