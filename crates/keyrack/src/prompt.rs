//! Reading secrets from the operator
//!
//! Terminal handling lives behind `SecretReader` so the vaults and the
//! unlock service never touch a tty directly.

use crate::error::{KeyrackError, Result};
use crate::secret::SecretValue;
use std::io::{BufRead, IsTerminal};
use std::sync::Mutex;

pub trait SecretReader: Send + Sync {
    /// Read one line without echoing it
    fn read_secret(&self, prompt: &str) -> Result<SecretValue>;
}

/// Hidden input on the controlling terminal, or one line of piped stdin
pub struct TerminalReader;

impl SecretReader for TerminalReader {
    fn read_secret(&self, prompt: &str) -> Result<SecretValue> {
        let value = if std::io::stdin().is_terminal() {
            rpassword::prompt_password(prompt)
                .map_err(|e| KeyrackError::InvalidInput(format!("failed to read input: {}", e)))?
        } else {
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line)?;
            line.trim_end_matches(['\r', '\n']).to_string()
        };

        if value.is_empty() {
            return Err(KeyrackError::InvalidInput("empty value not allowed".to_string()));
        }
        Ok(SecretValue::new(value))
    }
}

/// Never prompts; used for `silent` unlocks and non-interactive callers
pub struct NoPrompt;

impl SecretReader for NoPrompt {
    fn read_secret(&self, _prompt: &str) -> Result<SecretValue> {
        Err(KeyrackError::UnlockFailed(
            "interactive input is disabled".to_string(),
        ))
    }
}

/// Answers from a fixed list, in order
pub struct ScriptedReader {
    answers: Mutex<Vec<SecretValue>>,
}

impl ScriptedReader {
    pub fn new(answers: impl IntoIterator<Item = impl Into<SecretValue>>) -> Self {
        let mut answers: Vec<SecretValue> = answers.into_iter().map(Into::into).collect();
        answers.reverse();
        Self {
            answers: Mutex::new(answers),
        }
    }
}

impl SecretReader for ScriptedReader {
    fn read_secret(&self, _prompt: &str) -> Result<SecretValue> {
        self.answers
            .lock()
            .map_err(|_| KeyrackError::InvalidInput("reader poisoned".to_string()))?
            .pop()
            .ok_or_else(|| KeyrackError::InvalidInput("no input left".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_reader_answers_in_order() {
        let reader = ScriptedReader::new(["first", "second"]);
        assert_eq!(reader.read_secret("?").unwrap().expose(), "first");
        assert_eq!(reader.read_secret("?").unwrap().expose(), "second");
        assert!(reader.read_secret("?").is_err());
    }

    #[test]
    fn test_no_prompt_is_unlock_failure() {
        assert!(matches!(
            NoPrompt.read_secret("passphrase: "),
            Err(KeyrackError::UnlockFailed(_))
        ));
    }
}
