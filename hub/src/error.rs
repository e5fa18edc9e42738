//! Hub-side error taxonomy, per spec.md §7.

#[derive(Debug, Clone, thiserror::Error)]
pub enum HubError {
    #[error("permission denied: role {0:?} required")]
    PermissionDenied(String),
    #[error("permission lost: role {0:?} is no longer granted")]
    PermissionLost(String),
    #[error("no candidate places exist")]
    NoSuchCandidates,
    #[error("all candidate places are gone")]
    AllCandidatesGone,
    #[error("authentication error: {0}")]
    Auth(String),
    #[error("{0}")]
    Other(String),
}
