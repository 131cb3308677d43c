//! The dialog table: lookup by (Call-ID, local tag, remote tag).

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;

use waveline_sip_core::{HeaderAccess, Request, Response};

use crate::dialog::{Dialog, DialogId};
use crate::errors::{Error, Result};

/// Concurrent dialog table.
///
/// Dialogs are stored behind their own mutex; all dialog mutation
/// happens under it, per the one-lock-per-dialog discipline.
pub struct DialogManager {
    dialogs: DashMap<DialogId, Arc<Mutex<Dialog>>>,
}

impl DialogManager {
    pub fn new() -> Self {
        DialogManager { dialogs: DashMap::new() }
    }

    /// Insert a new dialog under its current id.
    pub fn insert(&self, dialog: Dialog) -> Arc<Mutex<Dialog>> {
        let id = dialog.id.clone();
        let entry = Arc::new(Mutex::new(dialog));
        debug!(%id, "dialog registered");
        self.dialogs.insert(id, entry.clone());
        entry
    }

    /// Move a half-open UAC dialog to its full id once the remote tag
    /// is known. The caller must already have updated `dialog.id`.
    pub fn rekey(&self, old_id: &DialogId, new_id: DialogId) {
        if let Some((_, entry)) = self.dialogs.remove(old_id) {
            debug!(old = %old_id, new = %new_id, "dialog re-keyed");
            self.dialogs.insert(new_id, entry);
        }
    }

    /// Match an incoming request: its From tag is our remote tag, its
    /// To tag is our local tag.
    pub fn match_request(&self, request: &Request) -> Option<Arc<Mutex<Dialog>>> {
        let call_id = request.call_id()?;
        let local_tag = request.to_header()?.tag()?;
        let remote_tag = request.from_header()?.tag()?;
        let id =
            DialogId::new(call_id, local_tag, Some(remote_tag.to_string()));
        self.dialogs.get(&id).map(|e| e.value().clone())
    }

    /// Match an incoming response: its From tag is our local tag, its
    /// To tag is our remote tag. Falls back to the half-open entry for
    /// the first tagged response of a UAC dialog.
    pub fn match_response(&self, response: &Response) -> Option<Arc<Mutex<Dialog>>> {
        let call_id = response.call_id()?;
        let local_tag = response.from_header()?.tag()?;
        let remote_tag = response.to_tag();

        if let Some(tag) = remote_tag {
            let id = DialogId::new(call_id, local_tag, Some(tag.to_string()));
            if let Some(entry) = self.dialogs.get(&id) {
                return Some(entry.value().clone());
            }
        }
        // Half-open UAC dialog: no remote tag yet.
        let id = DialogId::new(call_id, local_tag, None);
        self.dialogs.get(&id).map(|e| e.value().clone())
    }

    pub fn get(&self, id: &DialogId) -> Option<Arc<Mutex<Dialog>>> {
        self.dialogs.get(id).map(|e| e.value().clone())
    }

    pub fn remove(&self, id: &DialogId) -> Result<()> {
        self.dialogs
            .remove(id)
            .map(|_| debug!(%id, "dialog removed"))
            .ok_or_else(|| Error::UnknownDialog(id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.dialogs.len()
    }
}

impl Default for DialogManager {
    fn default() -> Self {
        DialogManager::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waveline_sip_core::{Address, parse_request, parse_response};

    fn contact() -> Address {
        "<sip:alice@192.0.2.1>".parse().unwrap()
    }

    fn invite() -> Request {
        parse_request(
            b"INVITE sip:bob@biloxi.com SIP/2.0\r\n\
              Via: SIP/2.0/UDP atlanta.com;branch=z9hG4bKmgr\r\nMax-Forwards: 70\r\n\
              To: <sip:bob@biloxi.com>\r\nFrom: <sip:alice@atlanta.com>;tag=alice1\r\n\
              Call-ID: mgr-test\r\nCSeq: 1 INVITE\r\nContact: <sip:alice@192.0.2.1>\r\n\r\n",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn uac_dialog_matching_through_rekey() {
        let manager = DialogManager::new();
        let dialog = Dialog::new_uac(&invite(), contact()).unwrap();
        let old_id = dialog.id.clone();
        let entry = manager.insert(dialog);

        let response = parse_response(
            b"SIP/2.0 180 Ringing\r\n\
              Via: SIP/2.0/UDP atlanta.com;branch=z9hG4bKmgr\r\n\
              To: <sip:bob@biloxi.com>;tag=bob9\r\nFrom: <sip:alice@atlanta.com>;tag=alice1\r\n\
              Call-ID: mgr-test\r\nCSeq: 1 INVITE\r\n\r\n",
        )
        .unwrap();

        // Before the tag is learned, matching falls back to the
        // half-open entry.
        let matched = manager.match_response(&response).expect("half-open match");
        {
            let mut dlg = matched.lock().await;
            dlg.on_uac_response(&response).unwrap();
            manager.rekey(&old_id, dlg.id.clone());
        }
        assert!(Arc::ptr_eq(&entry, &matched));

        // After re-keying, the full id matches directly.
        let again = manager.match_response(&response).expect("full match");
        assert!(Arc::ptr_eq(&entry, &again));
    }

    #[tokio::test]
    async fn uas_dialog_matches_in_dialog_request() {
        let manager = DialogManager::new();
        let dialog = Dialog::new_uas(&invite(), contact()).unwrap();
        let local_tag = dialog.id.local_tag.clone();
        manager.insert(dialog);

        let bye_raw = format!(
            "BYE sip:alice@192.0.2.1 SIP/2.0\r\n\
             Via: SIP/2.0/UDP biloxi.com;branch=z9hG4bKbye2\r\nMax-Forwards: 70\r\n\
             To: <sip:bob@biloxi.com>;tag={}\r\nFrom: <sip:alice@atlanta.com>;tag=alice1\r\n\
             Call-ID: mgr-test\r\nCSeq: 2 BYE\r\n\r\n",
            local_tag
        );
        let bye = parse_request(bye_raw.as_bytes()).unwrap();
        assert!(manager.match_request(&bye).is_some());

        // A different Call-ID must not match.
        let other = parse_request(
            bye_raw.replace("mgr-test", "other-call").as_bytes(),
        )
        .unwrap();
        assert!(manager.match_request(&other).is_none());
    }
}
