//! blobcrypt - Convergent blob encryption with deduplicating backup
//!
//! Keys are derived from content (plus an optional convergence secret),
//! so identical plaintext always produces identical ciphertext and the
//! content-addressed store deduplicates for free. Around the codec sit
//! an incremental backup engine driven by a persisted manifest, and a
//! sealing layer that wraps the manifest for an RSA recipient.
//!
//! Deliberately out of scope: confidentiality against anyone who already
//! holds the plaintext. Convergent encryption is confirmable by design.
//!
//! ```no_run
//! use blobcrypt::{backup, BackupConfig, SecretMap};
//!
//! let config = BackupConfig::new("/home/me/docs".into(), "/backups/docs".into());
//! let summary = backup(&config, &SecretMap::new(), None)?;
//! println!("wrote {} blobs", summary.written);
//! # Ok::<(), blobcrypt::Error>(())
//! ```

pub mod archive;
pub mod backup;
pub mod config;
pub mod crypto;
pub mod error;
pub mod fingerprint;
pub mod manifest;
pub mod restore;
pub mod scan;
pub mod store;
pub mod worker;

pub use backup::{backup, BackupSummary};
pub use config::BackupConfig;
pub use error::{Error, Result};
pub use manifest::{Manifest, ManifestDiff, ManifestEntry};
pub use restore::{open_manifest, restore_file, restore_tree, RestoreSummary};
pub use scan::{scan, ScanResult, SecretMap};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::BackupConfig;
    pub use crate::crypto::Key;
    pub use crate::error::{Error, Result};
    pub use crate::manifest::Manifest;
    pub use crate::scan::SecretMap;
}

/// Route tracing output through the libtest capture so failing driver
/// tests show their logs. Safe to call from every test; only the first
/// call installs the subscriber.
#[cfg(test)]
pub(crate) fn init_test_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
