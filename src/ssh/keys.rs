//! Private key material for public-key authentication.

use std::path::PathBuf;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::interact;

#[derive(Default)]
struct KeyState {
    pem: Option<String>,
    passphrase: Option<String>,
}

/// A private key, either read from a file or given directly as PEM data.
/// The key material and the passphrase are loaded once and cached; keep
/// references to one instance instead of copying it around.
pub struct RawPrivateKey {
    pub name: String,
    pub file: Option<PathBuf>,
    state: Mutex<KeyState>,
}

impl std::fmt::Debug for RawPrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut d = f.debug_struct("RawPrivateKey");
        if !self.name.is_empty() {
            d.field("name", &self.name);
        }
        if let Some(file) = &self.file {
            d.field("file", file);
        }
        d.field("material", &"REDACTED");
        d.finish()
    }
}

impl RawPrivateKey {
    pub fn from_pem(pem: Vec<u8>, passphrase: Option<String>) -> RawPrivateKey {
        RawPrivateKey {
            name: String::new(),
            file: None,
            state: Mutex::new(KeyState {
                pem: Some(String::from_utf8_lossy(&pem).into_owned()),
                passphrase,
            }),
        }
    }

    pub fn from_file(path: PathBuf) -> RawPrivateKey {
        RawPrivateKey {
            name: path.display().to_string(),
            file: Some(path),
            state: Mutex::new(KeyState::default()),
        }
    }

    /// Returns the PEM text and the passphrase known so far, reading the
    /// key file on first use.
    pub fn material(&self) -> Result<(String, Option<String>)> {
        let mut state = self.state.lock();
        if state.pem.is_none() {
            let file = self.file.as_ref().ok_or_else(|| {
                Error::Config("no private key can be loaded".to_string())
            })?;
            let pem = std::fs::read_to_string(file).map_err(|e| {
                Error::Config(format!("cannot read private key {}: {}", file.display(), e))
            })?;
            state.pem = Some(pem);
        }
        Ok((state.pem.clone().expect("pem loaded above"), state.passphrase.clone()))
    }

    /// Prompts for the passphrase and caches it so the user is asked once.
    pub fn ask_passphrase(&self) -> String {
        let mut state = self.state.lock();
        if let Some(p) = &state.passphrase {
            return p.clone();
        }
        let prompt = if self.name.is_empty() {
            "Enter passphrase: ".to_string()
        } else {
            format!("Enter passphrase for {}: ", self.name)
        };
        let pass = interact::ask_password(&prompt);
        state.passphrase = Some(pass.clone());
        pass
    }
}
