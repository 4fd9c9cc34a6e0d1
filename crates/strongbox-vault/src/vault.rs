//! Per-user encrypted key-value storage.
//!
//! Every value is encrypted with AES-256-GCM under the owner's session key
//! before it reaches SQLite. The owner, the value kind and the label are
//! bound into the ciphertext as associated data, so a row copied to another
//! label or another user fails authentication instead of decrypting.
//!
//! Labels are stored in plaintext so they can be listed without the key.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::instrument;
use zeroize::Zeroize;

use crate::crypto::{self, KeyMaterial};
use crate::db::Database;
use crate::error::{Result, VaultError};
use crate::session::Session;

/// Longest label accepted by [`DataVault::store`].
pub const MAX_LABEL_LEN: usize = 256;

/// Domain prefix of the associated data of every entry.
const ENTRY_AAD_CONTEXT: &[u8] = b"strongbox/entry/v1";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// The kind of a stored value, kept next to the ciphertext so the value
/// deserializes back into the same variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    /// A UTF-8 string.
    Text,
    /// A JSON document.
    Structured,
}

impl ValueKind {
    /// Convert to the string stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Structured => "structured",
        }
    }

    /// Parse from the string stored in SQLite.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Self::Text),
            "structured" => Some(Self::Structured),
            _ => None,
        }
    }
}

impl std::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A value held in the vault.
///
/// A value stored as one variant is always retrieved as the same variant
/// with identical content.
#[derive(Debug, Clone, PartialEq)]
pub enum VaultValue {
    Text(String),
    Structured(serde_json::Value),
}

impl VaultValue {
    /// Serialize any `T` into a structured value.
    pub fn structured<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self::Structured(serde_json::to_value(value)?))
    }

    /// Which variant this is.
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Text(_) => ValueKind::Text,
            Self::Structured(_) => ValueKind::Structured,
        }
    }

    /// The string, if this is a text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Structured(_) => None,
        }
    }

    /// The JSON document, if this is a structured value.
    pub fn as_structured(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Structured(value) => Some(value),
            Self::Text(_) => None,
        }
    }

    /// Deserialize a structured value into `T`.
    ///
    /// # Errors
    ///
    /// [`VaultError::InvalidInput`] for a text value, or
    /// [`VaultError::Serialization`] if the document does not fit `T`.
    pub fn into_structured<T: DeserializeOwned>(self) -> Result<T> {
        match self {
            Self::Structured(value) => Ok(serde_json::from_value(value)?),
            Self::Text(_) => Err(VaultError::InvalidInput(
                "value is text, not structured".into(),
            )),
        }
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        match self {
            Self::Text(text) => Ok(text.as_bytes().to_vec()),
            Self::Structured(value) => Ok(serde_json::to_vec(value)?),
        }
    }

    fn from_bytes(kind: ValueKind, mut bytes: Vec<u8>) -> Result<Self> {
        match kind {
            ValueKind::Text => String::from_utf8(bytes).map(Self::Text).map_err(|e| {
                e.into_bytes().zeroize();
                VaultError::Internal("stored text value is not valid UTF-8".into())
            }),
            ValueKind::Structured => {
                let parsed = serde_json::from_slice(&bytes);
                bytes.zeroize();
                Ok(Self::Structured(parsed?))
            }
        }
    }
}

impl From<&str> for VaultValue {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for VaultValue {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<serde_json::Value> for VaultValue {
    fn from(value: serde_json::Value) -> Self {
        Self::Structured(value)
    }
}

/// Metadata of a stored entry, readable without the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySummary {
    pub label: String,
    pub kind: ValueKind,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An entry exactly as persisted: still encrypted.
#[derive(Debug, Clone)]
pub(crate) struct SealedEntry {
    pub label: String,
    pub kind: ValueKind,
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl SealedEntry {
    /// Decrypt under `key` as an entry of `owner`.
    pub(crate) fn open(&self, key: &KeyMaterial, owner: &str) -> Result<VaultValue> {
        let aad = entry_aad(owner, self.kind, &self.label);
        let plaintext = crypto::decrypt(key, &self.nonce, &self.ciphertext, &aad)?;
        VaultValue::from_bytes(self.kind, plaintext)
    }

    /// Encrypt `value` under `key` as the entry `label` of `owner`.
    fn seal(key: &KeyMaterial, owner: &str, label: &str, value: &VaultValue, now: i64) -> Result<Self> {
        let kind = value.kind();
        let aad = entry_aad(owner, kind, label);

        let mut plaintext = value.to_bytes()?;
        let sealed = crypto::encrypt(key, &plaintext, &aad);
        plaintext.zeroize();
        let (nonce, ciphertext) = sealed?;

        Ok(Self {
            label: label.to_string(),
            kind,
            ciphertext,
            nonce: nonce.to_vec(),
            created_at: now,
            updated_at: now,
        })
    }
}

// ---------------------------------------------------------------------------
// Data vault
// ---------------------------------------------------------------------------

/// Stores and retrieves the entries of the logged-in user.
///
/// Every operation takes the active [`Session`]; holding one is the proof
/// of a successful login, and its key is the only key used.
#[derive(Clone)]
pub struct DataVault {
    db: Database,
}

impl DataVault {
    /// Create a vault backed by `db`.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Encrypt `value` and store it under `label`, replacing any previous
    /// value with that label.
    ///
    /// # Errors
    ///
    /// [`VaultError::InvalidInput`] for an empty or over-long label.
    #[instrument(skip(self, session, value), fields(owner = %session.username()))]
    pub fn store(&self, session: &Session, label: &str, value: &VaultValue) -> Result<()> {
        validate_label(label)?;
        let owner = session.username();
        let now = Utc::now().timestamp();
        let entry = SealedEntry::seal(session.key(), owner, label, value, now)?;

        self.db.execute(|conn| upsert_sealed(conn, owner, &entry))?;

        tracing::info!(owner = owner, label = label, kind = %entry.kind, "stored entry");
        Ok(())
    }

    /// Decrypt and return the value stored under `label`.
    ///
    /// # Errors
    ///
    /// - [`VaultError::NotFound`] if the user has no such label.
    /// - [`VaultError::AuthenticationFailure`] if the stored ciphertext
    ///   does not verify under the session key.
    #[instrument(skip(self, session), fields(owner = %session.username()))]
    pub fn retrieve(&self, session: &Session, label: &str) -> Result<VaultValue> {
        let owner = session.username();
        let entry = self
            .db
            .execute(|conn| load_sealed_one(conn, owner, label))?
            .ok_or_else(|| VaultError::NotFound {
                label: label.to_string(),
            })?;

        let value = entry.open(session.key(), owner)?;
        tracing::debug!(owner = owner, label = label, "retrieved entry");
        Ok(value)
    }

    /// Labels of every entry the user owns, sorted. Nothing is decrypted.
    pub fn list_labels(&self, session: &Session) -> Result<Vec<String>> {
        let owner = session.username();
        self.db.execute(|conn| {
            let mut stmt = conn.prepare("SELECT label FROM entries WHERE owner = ?1 ORDER BY label")?;
            let labels = stmt
                .query_map(params![owner], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(labels)
        })
    }

    /// Metadata of every entry the user owns, sorted by label.
    pub fn entries(&self, session: &Session) -> Result<Vec<EntrySummary>> {
        let owner = session.username();
        self.db.execute(|conn| {
            let mut stmt = conn.prepare(
                "SELECT label, type_tag, created_at, updated_at
                 FROM entries WHERE owner = ?1 ORDER BY label",
            )?;
            let rows = stmt
                .query_map(params![owner], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(label, tag, created_at, updated_at)| {
                    Ok(EntrySummary {
                        label,
                        kind: parse_kind(&tag)?,
                        created_at: DateTime::from_timestamp(created_at, 0).unwrap_or_default(),
                        updated_at: DateTime::from_timestamp(updated_at, 0).unwrap_or_default(),
                    })
                })
                .collect()
        })
    }

    /// Remove the entry stored under `label`.
    ///
    /// # Errors
    ///
    /// [`VaultError::NotFound`] if the user has no such label.
    #[instrument(skip(self, session), fields(owner = %session.username()))]
    pub fn delete(&self, session: &Session, label: &str) -> Result<()> {
        let owner = session.username();
        let rows = self.db.execute(|conn| {
            Ok(conn.execute(
                "DELETE FROM entries WHERE owner = ?1 AND label = ?2",
                params![owner, label],
            )?)
        })?;

        if rows == 0 {
            return Err(VaultError::NotFound {
                label: label.to_string(),
            });
        }

        tracing::info!(owner = owner, label = label, "deleted entry");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row helpers shared with export and re-keying
// ---------------------------------------------------------------------------

/// Associated data binding an entry to its owner, kind and label.
pub(crate) fn entry_aad(owner: &str, kind: ValueKind, label: &str) -> Vec<u8> {
    let kind = kind.as_str();
    let mut aad = Vec::with_capacity(ENTRY_AAD_CONTEXT.len() + 8 + owner.len() + kind.len() + label.len());
    aad.extend_from_slice(ENTRY_AAD_CONTEXT);
    for field in [owner, kind] {
        let len = u32::try_from(field.len()).unwrap_or(u32::MAX);
        aad.extend_from_slice(&len.to_be_bytes());
        aad.extend_from_slice(field.as_bytes());
    }
    aad.extend_from_slice(label.as_bytes());
    aad
}

/// All entries of `owner`, still encrypted.
pub(crate) fn load_sealed(conn: &Connection, owner: &str) -> Result<Vec<SealedEntry>> {
    let mut stmt = conn.prepare(
        "SELECT label, type_tag, ciphertext, nonce, created_at, updated_at
         FROM entries WHERE owner = ?1 ORDER BY label",
    )?;
    let rows = stmt
        .query_map(params![owner], sealed_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter().map(into_sealed).collect()
}

/// Insert or replace one entry of `owner`. `created_at` of an existing row
/// is kept.
pub(crate) fn upsert_sealed(conn: &Connection, owner: &str, entry: &SealedEntry) -> Result<()> {
    conn.execute(
        "INSERT INTO entries (owner, label, type_tag, ciphertext, nonce, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(owner, label) DO UPDATE SET
             type_tag = excluded.type_tag,
             ciphertext = excluded.ciphertext,
             nonce = excluded.nonce,
             updated_at = excluded.updated_at",
        params![
            owner,
            entry.label,
            entry.kind.as_str(),
            entry.ciphertext,
            entry.nonce,
            entry.created_at,
            entry.updated_at,
        ],
    )?;
    Ok(())
}

/// Re-encrypt every entry of `owner` from `old` to `new`. Returns the
/// number of entries rewritten. Run it inside a transaction.
pub(crate) fn reencrypt_entries(
    conn: &Connection,
    owner: &str,
    old: &KeyMaterial,
    new: &KeyMaterial,
) -> Result<usize> {
    let entries = load_sealed(conn, owner)?;
    let now = Utc::now().timestamp();

    for entry in &entries {
        let value = entry.open(old, owner)?;
        let mut resealed = SealedEntry::seal(new, owner, &entry.label, &value, now)?;
        resealed.created_at = entry.created_at;
        resealed.updated_at = entry.updated_at;
        upsert_sealed(conn, owner, &resealed)?;
    }

    Ok(entries.len())
}

fn load_sealed_one(conn: &Connection, owner: &str, label: &str) -> Result<Option<SealedEntry>> {
    let row = conn
        .query_row(
            "SELECT label, type_tag, ciphertext, nonce, created_at, updated_at
             FROM entries WHERE owner = ?1 AND label = ?2",
            params![owner, label],
            sealed_row,
        )
        .optional()?;

    row.map(into_sealed).transpose()
}

type SealedRow = (String, String, Vec<u8>, Vec<u8>, i64, i64);

fn sealed_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SealedRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn into_sealed((label, tag, ciphertext, nonce, created_at, updated_at): SealedRow) -> Result<SealedEntry> {
    Ok(SealedEntry {
        label,
        kind: parse_kind(&tag)?,
        ciphertext,
        nonce,
        created_at,
        updated_at,
    })
}

fn parse_kind(tag: &str) -> Result<ValueKind> {
    ValueKind::parse(tag).ok_or_else(|| VaultError::Internal(format!("unknown entry type tag: {tag}")))
}

fn validate_label(label: &str) -> Result<()> {
    if label.is_empty() {
        return Err(VaultError::InvalidInput("label must not be empty".into()));
    }
    if label.chars().count() > MAX_LABEL_LEN {
        return Err(VaultError::InvalidInput(format!(
            "label must be at most {MAX_LABEL_LEN} characters"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn setup() -> (DataVault, Database) {
        let db = Database::open_in_memory().unwrap();
        db.execute(|conn| {
            conn.execute_batch(
                "INSERT INTO users (username, salt, key_verifier, created_at, updated_at)
                 VALUES ('alice', x'00', x'00', 0, 0), ('bob', x'00', x'00', 0, 0);",
            )?;
            Ok(())
        })
        .unwrap();
        (DataVault::new(db.clone()), db)
    }

    fn session(username: &str) -> Session {
        Session::new(username, KeyMaterial::generate().unwrap(), Utc::now())
    }

    #[test]
    fn text_round_trip() {
        let (vault, _) = setup();
        let alice = session("alice");

        vault
            .store(&alice, "secret_note", &"This is my secret note!".into())
            .unwrap();
        let value = vault.retrieve(&alice, "secret_note").unwrap();
        assert_eq!(value, VaultValue::Text("This is my secret note!".into()));
    }

    #[test]
    fn structured_round_trip() {
        let (vault, _) = setup();
        let alice = session("alice");
        let card = json!({ "number": "1234-5678-9012-3456", "expiry": "12/25", "cvv": "123" });

        vault
            .store(&alice, "credit_card", &VaultValue::from(card.clone()))
            .unwrap();
        let value = vault.retrieve(&alice, "credit_card").unwrap();
        assert_eq!(value.kind(), ValueKind::Structured);
        assert_eq!(value.as_structured(), Some(&card));
    }

    #[test]
    fn typed_structured_value() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Card {
            number: String,
            expiry: String,
            cvv: String,
        }

        let (vault, _) = setup();
        let alice = session("alice");
        let card = Card {
            number: "1234-5678-9012-3456".into(),
            expiry: "12/25".into(),
            cvv: "123".into(),
        };

        vault
            .store(&alice, "credit_card", &VaultValue::structured(&card).unwrap())
            .unwrap();
        let back: Card = vault
            .retrieve(&alice, "credit_card")
            .unwrap()
            .into_structured()
            .unwrap();
        assert_eq!(back, card);
    }

    #[test]
    fn listing_survives_corrupted_ciphertext() {
        let (vault, db) = setup();
        let alice = session("alice");
        vault
            .store(&alice, "secret_note", &"This is my secret note!".into())
            .unwrap();
        let card = json!({ "number": "1234-5678-9012-3456", "expiry": "12/25", "cvv": "123" });
        vault
            .store(&alice, "credit_card", &VaultValue::from(card))
            .unwrap();

        db.execute(|conn| {
            conn.execute("UPDATE entries SET ciphertext = x'deadbeef', nonce = x'00'", [])?;
            Ok(())
        })
        .unwrap();

        assert_eq!(
            vault.list_labels(&alice).unwrap(),
            vec!["credit_card", "secret_note"]
        );
        let kinds: Vec<_> = vault
            .entries(&alice)
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(kinds, vec![ValueKind::Structured, ValueKind::Text]);
        assert!(matches!(
            vault.retrieve(&alice, "secret_note"),
            Err(VaultError::AuthenticationFailure)
        ));
    }

    #[test]
    fn text_that_looks_like_json_stays_text() {
        let (vault, _) = setup();
        let alice = session("alice");

        vault.store(&alice, "note", &r#"{"a": 1}"#.into()).unwrap();
        let value = vault.retrieve(&alice, "note").unwrap();
        assert_eq!(value.as_text(), Some(r#"{"a": 1}"#));
    }

    #[test]
    fn overwrite_keeps_created_at() {
        let (vault, db) = setup();
        let alice = session("alice");

        vault.store(&alice, "note", &"first".into()).unwrap();
        db.execute(|conn| {
            conn.execute("UPDATE entries SET created_at = 42 WHERE label = 'note'", [])?;
            Ok(())
        })
        .unwrap();
        vault.store(&alice, "note", &json!({ "second": true }).into()).unwrap();

        let entries = vault.entries(&alice).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, ValueKind::Structured);
        assert_eq!(entries[0].created_at.timestamp(), 42);
    }

    #[test]
    fn retrieve_missing_is_not_found() {
        let (vault, _) = setup();
        let alice = session("alice");
        assert!(matches!(
            vault.retrieve(&alice, "nope"),
            Err(VaultError::NotFound { .. })
        ));
    }

    #[test]
    fn labels_are_per_user() {
        let (vault, _) = setup();
        let alice = session("alice");
        let bob = session("bob");

        vault.store(&alice, "b_label", &"1".into()).unwrap();
        vault.store(&alice, "a_label", &"2".into()).unwrap();
        vault.store(&bob, "bobs", &"3".into()).unwrap();

        assert_eq!(vault.list_labels(&alice).unwrap(), vec!["a_label", "b_label"]);
        assert_eq!(vault.list_labels(&bob).unwrap(), vec!["bobs"]);
        assert!(matches!(
            vault.retrieve(&bob, "a_label"),
            Err(VaultError::NotFound { .. })
        ));
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let (vault, _) = setup();
        let alice = session("alice");
        vault.store(&alice, "note", &"secret".into()).unwrap();

        let impostor = session("alice");
        assert!(matches!(
            vault.retrieve(&impostor, "note"),
            Err(VaultError::AuthenticationFailure)
        ));
    }

    #[test]
    fn moved_ciphertext_fails_authentication() {
        let (vault, db) = setup();
        let alice = session("alice");
        vault.store(&alice, "a", &"secret a".into()).unwrap();
        vault.store(&alice, "b", &"secret b".into()).unwrap();

        db.execute(|conn| {
            conn.execute(
                "UPDATE entries SET
                    ciphertext = (SELECT ciphertext FROM entries WHERE label = 'a'),
                    nonce = (SELECT nonce FROM entries WHERE label = 'a')
                 WHERE label = 'b'",
                [],
            )?;
            Ok(())
        })
        .unwrap();

        assert!(matches!(
            vault.retrieve(&alice, "b"),
            Err(VaultError::AuthenticationFailure)
        ));
    }

    #[test]
    fn ciphertext_does_not_contain_plaintext() {
        let (vault, db) = setup();
        let alice = session("alice");
        vault
            .store(&alice, "note", &"plaintext-marker-string".into())
            .unwrap();

        let ciphertext: Vec<u8> = db
            .execute(|conn| {
                Ok(conn.query_row("SELECT ciphertext FROM entries", [], |row| row.get(0))?)
            })
            .unwrap();
        let marker = b"plaintext-marker-string";
        assert!(!ciphertext.windows(marker.len()).any(|w| w == marker));
    }

    #[test]
    fn delete_entry() {
        let (vault, _) = setup();
        let alice = session("alice");
        vault.store(&alice, "note", &"x".into()).unwrap();

        vault.delete(&alice, "note").unwrap();
        assert!(vault.list_labels(&alice).unwrap().is_empty());
        assert!(matches!(
            vault.delete(&alice, "note"),
            Err(VaultError::NotFound { .. })
        ));
    }

    #[test]
    fn label_validation() {
        let (vault, _) = setup();
        let alice = session("alice");
        assert!(matches!(
            vault.store(&alice, "", &"x".into()),
            Err(VaultError::InvalidInput(_))
        ));
        assert!(matches!(
            vault.store(&alice, &"l".repeat(MAX_LABEL_LEN + 1), &"x".into()),
            Err(VaultError::InvalidInput(_))
        ));
    }

    #[test]
    fn reencrypt_moves_entries_to_new_key() {
        let (vault, db) = setup();
        let alice = session("alice");
        vault.store(&alice, "note", &"secret".into()).unwrap();
        vault.store(&alice, "card", &json!({ "n": 1 }).into()).unwrap();

        let new_key = KeyMaterial::generate().unwrap();
        let count = db
            .execute(|conn| reencrypt_entries(conn, "alice", alice.key(), &new_key))
            .unwrap();
        assert_eq!(count, 2);

        let rekeyed = Session::new("alice", new_key, Utc::now());
        assert_eq!(
            vault.retrieve(&rekeyed, "note").unwrap().as_text(),
            Some("secret")
        );
        assert!(matches!(
            vault.retrieve(&alice, "note"),
            Err(VaultError::AuthenticationFailure)
        ));
    }
}
