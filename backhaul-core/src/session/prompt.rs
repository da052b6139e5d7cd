/*!
Repository password entry.

The terminal implementation lives in the CLI; this module only holds the
enter/confirm protocol so it can be driven by a scripted prompt in tests.
*/

use tracing::warn;

use crate::Result;

/// Shown before a backup asks for a new repository password
pub const PASSWORD_WARNING: &str = "The repository password is not stored anywhere. \
If it is lost, the backup cannot be restored.";

const PASSWORD_LABEL: &str = "Enter repository password: ";
const CONFIRM_LABEL: &str = "Confirm repository password: ";

/// Source of secret input, read without echo
pub trait SecretPrompt {
    /// Show a notice to the user
    fn notify(&mut self, message: &str) -> Result<()>;

    /// Read one secret line after showing `label`
    fn read_secret(&mut self, label: &str) -> Result<String>;
}

/// Ask for the repository password.
///
/// With `confirm` set (backups) the warning is shown and the password is
/// entered twice; a mismatch starts over. Surrounding whitespace is dropped
/// and empty input always re-prompts.
pub fn enter_repository_password<P: SecretPrompt + ?Sized>(
    prompt: &mut P,
    confirm: bool,
) -> Result<String> {
    if confirm {
        prompt.notify(PASSWORD_WARNING)?;
    }

    loop {
        let password = read_non_empty(prompt, PASSWORD_LABEL)?;
        if !confirm {
            return Ok(password);
        }

        let confirmation = read_non_empty(prompt, CONFIRM_LABEL)?;
        if confirmation == password {
            return Ok(password);
        }
        warn!("Passwords do not match");
        prompt.notify("Passwords do not match, please try again.")?;
    }
}

fn read_non_empty<P: SecretPrompt + ?Sized>(prompt: &mut P, label: &str) -> Result<String> {
    loop {
        let value = prompt.read_secret(label)?;
        let value = value.trim();
        if !value.is_empty() {
            return Ok(value.to_string());
        }
        prompt.notify("Password must not be empty.")?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BackhaulError;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct ScriptedPrompt {
        answers: VecDeque<&'static str>,
        labels: Vec<String>,
        notices: Vec<String>,
    }

    impl ScriptedPrompt {
        fn new(answers: &[&'static str]) -> Self {
            Self {
                answers: answers.iter().copied().collect(),
                ..Self::default()
            }
        }
    }

    impl SecretPrompt for ScriptedPrompt {
        fn notify(&mut self, message: &str) -> Result<()> {
            self.notices.push(message.to_string());
            Ok(())
        }

        fn read_secret(&mut self, label: &str) -> Result<String> {
            self.labels.push(label.to_string());
            self.answers
                .pop_front()
                .map(str::to_string)
                .ok_or_else(|| BackhaulError::validation("no more input"))
        }
    }

    #[test]
    fn test_restore_prompts_once() {
        let mut prompt = ScriptedPrompt::new(&["hunter2"]);
        let password = enter_repository_password(&mut prompt, false).unwrap();

        assert_eq!(password, "hunter2");
        assert_eq!(prompt.labels, vec![PASSWORD_LABEL]);
        assert!(prompt.notices.is_empty());
    }

    #[test]
    fn test_backup_confirms_and_warns() {
        let mut prompt = ScriptedPrompt::new(&["hunter2", "hunter2"]);
        let password = enter_repository_password(&mut prompt, true).unwrap();

        assert_eq!(password, "hunter2");
        assert_eq!(prompt.labels, vec![PASSWORD_LABEL, CONFIRM_LABEL]);
        assert_eq!(prompt.notices[0], PASSWORD_WARNING);
    }

    #[test]
    fn test_mismatch_starts_over() {
        let mut prompt = ScriptedPrompt::new(&["first", "other", "second", "second"]);
        let password = enter_repository_password(&mut prompt, true).unwrap();

        assert_eq!(password, "second");
        assert_eq!(prompt.labels.len(), 4);
        assert!(prompt.notices.iter().any(|n| n.contains("do not match")));
    }

    #[test]
    fn test_empty_input_reprompts() {
        let mut prompt = ScriptedPrompt::new(&["", "", "pw"]);
        let password = enter_repository_password(&mut prompt, false).unwrap();

        assert_eq!(password, "pw");
        assert_eq!(prompt.labels.len(), 3);
    }

    #[test]
    fn test_whitespace_is_trimmed_and_blank_rejected() {
        let mut prompt = ScriptedPrompt::new(&["  ", " secret "]);
        let password = enter_repository_password(&mut prompt, false).unwrap();

        assert_eq!(password, "secret");
        assert_eq!(prompt.notices, vec!["Password must not be empty."]);
    }

    #[test]
    fn test_confirmation_compares_trimmed_entries() {
        let mut prompt = ScriptedPrompt::new(&["secret ", "secret"]);
        assert_eq!(enter_repository_password(&mut prompt, true).unwrap(), "secret");
    }

    #[test]
    fn test_prompt_errors_propagate() {
        let mut prompt = ScriptedPrompt::new(&[]);
        assert!(enter_repository_password(&mut prompt, false).is_err());
    }
}
