//! Terminal interaction.
//!
//! One process-wide mutex guards the terminal so concurrent prompts do not
//! interleave. Every component that needs the terminal takes the lock.

use std::io::{BufRead, Write};

use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard};

static INTERACTION: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Takes the interaction lock; prompts happen while the guard is held.
pub fn lock_for_interaction() -> MutexGuard<'static, ()> {
    INTERACTION.lock()
}

/// Asks something with a prompt and returns the entered line.
pub fn ask(prompt: &str) -> String {
    let _guard = lock_for_interaction();
    print!("{}", prompt);
    let _ = std::io::stdout().flush();
    let mut line = String::new();
    let _ = std::io::stdin().lock().read_line(&mut line);
    line.trim_end_matches(&['\n', '\r'][..]).to_string()
}

/// Asks for a password using the terminal.
pub fn ask_password(prompt: &str) -> String {
    ask(prompt)
}
