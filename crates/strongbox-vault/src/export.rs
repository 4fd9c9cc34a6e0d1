//! Encrypted export and import of a user's entries.
//!
//! An export is a JSON document:
//!
//! ```json
//! { "format": "strongbox-export", "version": 1, "nonce": "<base64>", "ciphertext": "<base64>" }
//! ```
//!
//! The ciphertext seals, under the owner's key, a payload listing the owner,
//! the export time and every entry in its stored (still encrypted) form.
//! Only the same user holding the same key can import it; a bundle from a
//! passkey that has since been changed no longer opens.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::crypto;
use crate::db::Database;
use crate::error::{Result, VaultError};
use crate::session::Session;
use crate::vault::{self, SealedEntry, ValueKind};

/// Value of [`ExportBundle::format`].
pub const EXPORT_FORMAT: &str = "strongbox-export";

/// Current bundle version.
pub const EXPORT_VERSION: u32 = 1;

const EXPORT_AAD_CONTEXT: &[u8] = b"strongbox/export/v1";

/// A sealed export of one user's entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportBundle {
    pub format: String,
    pub version: u32,
    /// Base64 AES-GCM nonce.
    pub nonce: String,
    /// Base64 sealed payload.
    pub ciphertext: String,
}

impl ExportBundle {
    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse a bundle from JSON.
    ///
    /// # Errors
    ///
    /// [`VaultError::InvalidExport`] if the document is not a bundle.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| VaultError::InvalidExport {
            reason: e.to_string(),
        })
    }
}

#[derive(Serialize, Deserialize)]
struct ExportPayload {
    version: u32,
    owner: String,
    exported_at: DateTime<Utc>,
    entries: Vec<ExportedEntry>,
}

#[derive(Serialize, Deserialize)]
struct ExportedEntry {
    label: String,
    kind: ValueKind,
    nonce: String,
    ciphertext: String,
    created_at: i64,
    updated_at: i64,
}

/// Seal every entry of the session's user into a bundle.
///
/// # Errors
///
/// [`VaultError::NothingToExport`] if the user has no entries.
pub fn export_entries(db: &Database, session: &Session) -> Result<ExportBundle> {
    let owner = session.username();
    let sealed = db.execute(|conn| vault::load_sealed(conn, owner))?;
    if sealed.is_empty() {
        return Err(VaultError::NothingToExport);
    }

    let payload = ExportPayload {
        version: EXPORT_VERSION,
        owner: owner.to_string(),
        exported_at: Utc::now(),
        entries: sealed
            .into_iter()
            .map(|entry| ExportedEntry {
                label: entry.label,
                kind: entry.kind,
                nonce: BASE64.encode(&entry.nonce),
                ciphertext: BASE64.encode(&entry.ciphertext),
                created_at: entry.created_at,
                updated_at: entry.updated_at,
            })
            .collect(),
    };
    let count = payload.entries.len();

    let mut plaintext = serde_json::to_vec(&payload)?;
    let sealed = crypto::encrypt(session.key(), &plaintext, &export_aad(owner));
    plaintext.zeroize();
    let (nonce, ciphertext) = sealed?;

    tracing::info!(owner = owner, count = count, "exported entries");

    Ok(ExportBundle {
        format: EXPORT_FORMAT.to_string(),
        version: EXPORT_VERSION,
        nonce: BASE64.encode(nonce),
        ciphertext: BASE64.encode(ciphertext),
    })
}

/// Open `bundle` with the session key and merge its entries into the
/// user's vault. Imported labels replace existing ones. Returns the number
/// of entries imported.
///
/// Nothing is written unless every entry authenticates.
///
/// # Errors
///
/// - [`VaultError::InvalidExport`] for an unknown format or version, bad
///   base64, or a bundle exported by another user.
/// - [`VaultError::AuthenticationFailure`] if the bundle or any entry does
///   not open under the session key.
pub fn import_entries(db: &Database, session: &Session, bundle: &ExportBundle) -> Result<usize> {
    if bundle.format != EXPORT_FORMAT {
        return Err(VaultError::InvalidExport {
            reason: format!("unexpected format {:?}", bundle.format),
        });
    }
    if bundle.version != EXPORT_VERSION {
        return Err(VaultError::InvalidExport {
            reason: format!("unsupported version {}", bundle.version),
        });
    }

    let owner = session.username();
    let nonce = decode(&bundle.nonce, "nonce")?;
    let ciphertext = decode(&bundle.ciphertext, "ciphertext")?;

    let mut plaintext = crypto::decrypt(session.key(), &nonce, &ciphertext, &export_aad(owner))?;
    let parsed: std::result::Result<ExportPayload, _> = serde_json::from_slice(&plaintext);
    plaintext.zeroize();
    let payload = parsed.map_err(|e| VaultError::InvalidExport {
        reason: format!("payload: {e}"),
    })?;

    if payload.owner != owner {
        return Err(VaultError::InvalidExport {
            reason: "bundle belongs to another user".into(),
        });
    }

    let entries = payload
        .entries
        .into_iter()
        .map(|entry| {
            let sealed = SealedEntry {
                nonce: decode(&entry.nonce, "entry nonce")?,
                ciphertext: decode(&entry.ciphertext, "entry ciphertext")?,
                label: entry.label,
                kind: entry.kind,
                created_at: entry.created_at,
                updated_at: entry.updated_at,
            };
            // Fails with AuthenticationFailure before anything is written.
            sealed.open(session.key(), owner)?;
            Ok(sealed)
        })
        .collect::<Result<Vec<_>>>()?;

    let count = db.execute_mut(|conn| {
        let tx = conn.transaction()?;
        for entry in &entries {
            vault::upsert_sealed(&tx, owner, entry)?;
        }
        tx.commit()?;
        Ok(entries.len())
    })?;

    tracing::info!(
        owner = owner,
        count = count,
        exported_at = %payload.exported_at,
        "imported entries"
    );
    Ok(count)
}

fn export_aad(owner: &str) -> Vec<u8> {
    let mut aad = EXPORT_AAD_CONTEXT.to_vec();
    aad.extend_from_slice(owner.as_bytes());
    aad
}

fn decode(value: &str, field: &str) -> Result<Vec<u8>> {
    BASE64.decode(value).map_err(|e| VaultError::InvalidExport {
        reason: format!("{field} is not valid base64: {e}"),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
