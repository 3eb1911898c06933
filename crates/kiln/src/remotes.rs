//! Resolution of remote specs into connected cache service clients.
//!
//! A project's configured remote specs resolve into an ordered list of
//! remotes: the first successful remote wins on pull, and every push-enabled
//! remote receives pushes. Index-type remotes answer ref lookups, storage
//! remotes move blobs; an `all`-type remote does both.

use std::sync::Arc;

use kiln_cas::remote::{Channel, RemoteAssets, RemoteCas};
use kiln_types::{RemoteSpec, RemoteType, Result};

/// Connected clients for one ordered set of remote specs.
#[derive(Default, Clone)]
pub struct CacheRemotes {
    index: Vec<RemoteAssets>,
    storage: Vec<RemoteCas>,
    push_index: Vec<RemoteAssets>,
    push_storage: Vec<RemoteCas>,
}

impl CacheRemotes {
    /// Connect every spec, preserving order. Connection setup failures
    /// surface immediately; they are configuration problems, not transient
    /// network state.
    pub fn connect(specs: &[RemoteSpec]) -> Result<Self> {
        let mut remotes = Self::default();
        for spec in specs {
            let channel: Arc<Channel> = Channel::connect(spec)?;
            let serves_index = matches!(spec.remote_type, RemoteType::Index | RemoteType::All);
            let serves_storage = matches!(spec.remote_type, RemoteType::Storage | RemoteType::All);
            if serves_index {
                remotes.index.push(RemoteAssets::new(channel.clone()));
                if spec.push {
                    remotes.push_index.push(RemoteAssets::new(channel.clone()));
                }
            }
            if serves_storage {
                remotes.storage.push(RemoteCas::new(channel.clone()));
                if spec.push {
                    remotes.push_storage.push(RemoteCas::new(channel.clone()));
                }
            }
        }
        Ok(remotes)
    }

    pub fn has_fetch_remotes(&self) -> bool {
        !self.index.is_empty() && !self.storage.is_empty()
    }

    pub fn has_push_remotes(&self) -> bool {
        !self.push_index.is_empty() && !self.push_storage.is_empty()
    }

    /// Index remotes in pull priority order.
    pub fn index(&self) -> &[RemoteAssets] {
        &self.index
    }

    /// Storage remotes in pull priority order.
    pub fn storage(&self) -> &[RemoteCas] {
        &self.storage
    }

    pub fn push_index(&self) -> &[RemoteAssets] {
        &self.push_index
    }

    pub fn push_storage(&self) -> &[RemoteCas] {
        &self.push_storage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(s: &str) -> RemoteSpec {
        s.parse().expect("spec")
    }

    #[test]
    fn no_specs_means_no_remotes() {
        let remotes = CacheRemotes::connect(&[]).expect("connect");
        assert!(!remotes.has_fetch_remotes());
        assert!(!remotes.has_push_remotes());
    }

    #[test]
    fn all_type_serves_both_roles() {
        let remotes = CacheRemotes::connect(&[spec("https://cache.test,push=true")]).expect("connect");
        assert!(remotes.has_fetch_remotes());
        assert!(remotes.has_push_remotes());
        assert_eq!(remotes.index().len(), 1);
        assert_eq!(remotes.storage().len(), 1);
    }

    #[test]
    fn index_only_remote_cannot_fetch_alone() {
        let remotes = CacheRemotes::connect(&[spec("https://cache.test,type=index")]).expect("connect");
        // A ref lookup without blob storage cannot complete a pull.
        assert!(!remotes.has_fetch_remotes());
    }

    #[test]
    fn push_requires_the_push_flag() {
        let remotes =
            CacheRemotes::connect(&[spec("https://a.test"), spec("https://b.test,push=true")])
                .expect("connect");
        assert_eq!(remotes.storage().len(), 2);
        assert_eq!(remotes.push_storage().len(), 1);
    }
}
