//! Per-connection session state: authenticated context, bound sharing,
//! working directory and live transfers. Mutated only by the connection's
//! own worker thread.

use crate::protocol::ErrorCode;
use crate::sharing::Sharing;
use crate::transfer::TransferHandle;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

pub struct Session {
    pub id: u64,
    pub peer: SocketAddr,
    pub authenticated: bool,
    sharing: Option<Arc<Sharing>>,
    /// Absolute path, always inside the bound sharing's root
    pub cwd: PathBuf,
    transfers: HashMap<u64, Arc<TransferHandle>>,
    next_transfer_id: u64,
}

impl Session {
    pub fn new(id: u64, peer: SocketAddr, authenticated: bool) -> Session {
        Session {
            id,
            peer,
            authenticated,
            sharing: None,
            cwd: PathBuf::new(),
            transfers: HashMap::new(),
            next_transfer_id: 1,
        }
    }

    pub fn bind(&mut self, sharing: Arc<Sharing>) -> Result<(), ErrorCode> {
        if self.sharing.is_some() {
            return Err(ErrorCode::AlreadyBound);
        }
        self.cwd = sharing.root.clone();
        self.sharing = Some(sharing);
        Ok(())
    }

    pub fn unbind(&mut self) -> Result<(), ErrorCode> {
        if self.sharing.take().is_none() {
            return Err(ErrorCode::NotBound);
        }
        self.cwd = PathBuf::new();
        Ok(())
    }

    pub fn sharing(&self) -> Result<&Arc<Sharing>, ErrorCode> {
        self.sharing.as_ref().ok_or(ErrorCode::NotBound)
    }

    pub fn register_transfer(&mut self, handle: Arc<TransferHandle>) -> u64 {
        let id = self.next_transfer_id;
        self.next_transfer_id += 1;
        self.transfers.insert(id, handle);
        id
    }

    pub fn transfer(&self, id: u64) -> Option<&Arc<TransferHandle>> {
        self.transfers.get(&id)
    }

    /// Session teardown: close every owned transfer.
    pub fn abort_transfers(&mut self) {
        for handle in self.transfers.values() {
            handle.abort();
        }
        self.transfers.clear();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.abort_transfers();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sharing::Sharing;
    use tempfile::TempDir;

    fn session() -> Session {
        Session::new(1, "127.0.0.1:9999".parse().unwrap(), true)
    }

    #[test]
    fn bind_unbind_state_machine() {
        let tmp = TempDir::new().unwrap();
        let sharing = Arc::new(Sharing::register(Some("s"), tmp.path(), false).unwrap());

        let mut sess = session();
        assert_eq!(sess.sharing().unwrap_err(), ErrorCode::NotBound);
        assert_eq!(sess.unbind().unwrap_err(), ErrorCode::NotBound);

        sess.bind(Arc::clone(&sharing)).unwrap();
        assert_eq!(sess.cwd, sharing.root);
        assert_eq!(sess.bind(Arc::clone(&sharing)).unwrap_err(), ErrorCode::AlreadyBound);

        sess.unbind().unwrap();
        assert_eq!(sess.sharing().unwrap_err(), ErrorCode::NotBound);
    }

    #[test]
    fn transfer_ids_are_unique() {
        let mut sess = session();
        let a = sess.register_transfer(crate::transfer::TransferHandle::detached());
        let b = sess.register_transfer(crate::transfer::TransferHandle::detached());
        assert_ne!(a, b);
        assert!(sess.transfer(a).is_some());
        assert!(sess.transfer(99).is_none());
    }
}
