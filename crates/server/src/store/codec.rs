//! Conversion between [`Requester`] and its persisted record shape.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::StoreError;
use crate::oauth2::arguments::Arguments;
use crate::oauth2::client::ClientManager;
use crate::oauth2::requester::{FormData, Requester, Session};

pub const SQL_DELIMITER: char = ',';
pub const DOCUMENT_DELIMITER: char = '|';

/// Form fields that never reach storage.
const STRIPPED_FORM_KEYS: &[&str] = &["password", "client_secret"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequesterRecord {
    pub signature: String,
    pub request_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub requested_at: OffsetDateTime,
    pub client_id: String,
    pub scope: String,
    pub granted_scope: String,
    pub requested_audience: String,
    pub granted_audience: String,
    pub form_data: String,
    pub subject: String,
    pub session_data: String,
}

/// Flattens sets with a backend specific delimiter. Values must not contain it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequesterCodec {
    delimiter: char,
}

impl RequesterCodec {
    pub const fn new(delimiter: char) -> Self {
        Self { delimiter }
    }

    pub const fn sql() -> Self {
        Self::new(SQL_DELIMITER)
    }

    pub const fn document() -> Self {
        Self::new(DOCUMENT_DELIMITER)
    }

    pub fn join(&self, args: &Arguments) -> String {
        args.join(&self.delimiter.to_string())
    }

    pub fn split(&self, raw: &str) -> Arguments {
        Arguments::split(raw, self.delimiter)
    }

    pub fn encode(
        &self,
        signature: &str,
        requester: &Requester,
    ) -> Result<RequesterRecord, StoreError> {
        let mut form = requester.form.clone();
        for key in STRIPPED_FORM_KEYS {
            form.remove(key);
        }
        Ok(RequesterRecord {
            signature: signature.to_string(),
            request_id: requester.id.clone(),
            requested_at: requester.requested_at,
            client_id: requester.client.id.clone(),
            scope: self.join(&requester.requested_scope),
            granted_scope: self.join(&requester.granted_scope),
            requested_audience: self.join(&requester.requested_audience),
            granted_audience: self.join(&requester.granted_audience),
            form_data: form.encode(),
            subject: requester.session.subject.clone(),
            session_data: serde_json::to_string(&requester.session)?,
        })
    }

    /// Rebuilds a requester, resolving its client. A record whose client no longer
    /// exists cannot be decoded and reports [`StoreError::NotFound`].
    pub async fn decode(
        &self,
        record: &RequesterRecord,
        clients: &dyn ClientManager,
    ) -> Result<Requester, StoreError> {
        let client = clients.get_client(&record.client_id).await?;
        let session: Session = if record.session_data.is_empty() {
            Session::new(record.subject.clone())
        } else {
            serde_json::from_str(&record.session_data)?
        };
        Ok(Requester {
            id: record.request_id.clone(),
            requested_at: record.requested_at,
            client,
            requested_scope: self.split(&record.scope),
            granted_scope: self.split(&record.granted_scope),
            requested_audience: self.split(&record.requested_audience),
            granted_audience: self.split(&record.granted_audience),
            grant_types: Arguments::new(),
            form: FormData::decode(&record.form_data),
            session,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth2::client::OAuthClient;
    use async_trait::async_trait;

    struct OneClient(OAuthClient);

    #[async_trait]
    impl ClientManager for OneClient {
        async fn get_client(&self, id: &str) -> Result<OAuthClient, StoreError> {
            if id == self.0.id {
                Ok(self.0.clone())
            } else {
                Err(StoreError::NotFound)
            }
        }

        async fn create_client(&self, _client: &OAuthClient) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn sample() -> Requester {
        let mut session = Session::new("7");
        session.set_user_id("7");
        let mut requester = Requester::new(OAuthClient::new("acme", "Acme"), session);
        requester.requested_scope = Arguments::from_space_delimited("root offline");
        requester.grant_scope("root");
        requester.grant_scope("offline");
        requester.form = [("username", "u"), ("password", "p"), ("client_secret", "s")]
            .into_iter()
            .collect();
        requester
    }

    #[tokio::test]
    async fn round_trip_preserves_sets_and_extras() {
        let clients = OneClient(OAuthClient::new("acme", "Acme"));
        let original = sample();
        for codec in [RequesterCodec::sql(), RequesterCodec::document()] {
            let record = codec.encode("sig", &original).unwrap();
            let decoded = codec.decode(&record, &clients).await.unwrap();
            assert_eq!(decoded.id, original.id);
            assert_eq!(decoded.granted_scope, original.granted_scope);
            assert_eq!(decoded.requested_scope, original.requested_scope);
            assert!(decoded.granted_audience.is_empty());
            assert_eq!(decoded.session.extra, original.session.extra);
            assert_eq!(decoded.form.get("username"), Some("u"));
            assert_eq!(decoded.form.get("password"), None);
            assert_eq!(decoded.form.get("client_secret"), None);
        }
    }

    #[test]
    fn delimiter_depends_on_backend() {
        let requester = sample();
        let sql = RequesterCodec::sql().encode("sig", &requester).unwrap();
        let doc = RequesterCodec::document().encode("sig", &requester).unwrap();
        assert_eq!(sql.granted_scope, "root,offline");
        assert_eq!(doc.granted_scope, "root|offline");
    }

    #[tokio::test]
    async fn orphaned_records_do_not_decode() {
        let clients = OneClient(OAuthClient::new("other", "Other"));
        let record = RequesterCodec::sql().encode("sig", &sample()).unwrap();
        let err = RequesterCodec::sql()
            .decode(&record, &clients)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }
}
