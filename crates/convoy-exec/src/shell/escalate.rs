//! Sudo prompt detection and credential injection
//!
//! [`Escalation`] watches both output streams of an escalated command. It
//! answers the sudo prompt with the configured password, releases buffered
//! stdin once the correlation id shows up on stderr, and turns the known
//! sudo failure messages into escalation errors. Everything else passes
//! through untouched.
//!
//! The machine is pure: it never touches a connection. The caller acts on
//! the [`EscalationAction`]s it returns.

use crate::error::ExecError;

/// Prompt passed to `sudo -p` and matched in output
pub const SUDO_PROMPT: &str = "[sudo] Convoy needs to run as another user, password: ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationState {
    /// Command runs without sudo, or through a custom run-as command
    NotEscalating,
    AwaitingPrompt,
    PasswordSent,
    Authenticated,
    /// The login user may not use sudo
    Denied,
    /// The password was not accepted
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn index(self) -> usize {
        match self {
            Stream::Stdout => 0,
            Stream::Stderr => 1,
        }
    }
}

#[derive(Debug)]
pub enum EscalationAction {
    /// Write this to stdin (password followed by a newline)
    SendPassword(String),
    /// The escalated command is ready for its real stdin
    ReleaseStdin,
    /// Abort the command
    Fail(ExecError),
}

/// Per-command escalation watcher
#[derive(Debug)]
pub struct Escalation {
    state: EscalationState,
    user: String,
    target: String,
    password: Option<String>,
    sudo_id: Option<String>,
    pending: [Vec<u8>; 2],
}

impl Escalation {
    /// Watcher for a command wrapped with `sudo -p`
    ///
    /// `user` is the login user and `target` the name used in messages.
    /// `sudo_id` is the correlation id echoed before stdin-bearing commands.
    pub fn new(
        user: impl Into<String>,
        target: impl Into<String>,
        password: Option<String>,
        sudo_id: Option<String>,
    ) -> Self {
        Self {
            state: EscalationState::AwaitingPrompt,
            user: user.into(),
            target: target.into(),
            password,
            sudo_id,
            pending: [Vec::new(), Vec::new()],
        }
    }

    /// Watcher that passes all output through
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            state: EscalationState::NotEscalating,
            user: String::new(),
            target: String::new(),
            password: None,
            sudo_id: None,
            pending: [Vec::new(), Vec::new()],
        }
    }

    #[must_use]
    pub fn state(&self) -> EscalationState {
        self.state
    }

    /// Scan a chunk of output
    ///
    /// Returns the bytes to keep as command output and the actions to take.
    /// A trailing partial line that could still become a prompt or the
    /// correlation id is held back until more data or [`finish`](Self::finish).
    pub fn feed(&mut self, stream: Stream, data: &[u8]) -> (Vec<u8>, Vec<EscalationAction>) {
        if self.state == EscalationState::NotEscalating {
            return (data.to_vec(), Vec::new());
        }

        let mut buffer = std::mem::take(&mut self.pending[stream.index()]);
        buffer.extend_from_slice(data);

        let mut output = Vec::new();
        let mut actions = Vec::new();
        let mut rest = buffer.as_slice();

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let (line, tail) = rest.split_at(pos + 1);
            rest = tail;
            match self.handle_line(line) {
                Some(action) => actions.push(action),
                None => output.extend_from_slice(line),
            }
        }

        // the prompt has no newline; text before it on the line is still output
        let prompt = SUDO_PROMPT.as_bytes();
        while let Some(at) = find(rest, prompt) {
            output.extend_from_slice(&rest[..at]);
            let end = at + prompt.len();
            if let Some(action) = self.handle_line(&rest[at..end]) {
                actions.push(action);
            }
            rest = &rest[end..];
        }

        if !rest.is_empty() {
            let held = self.held_suffix(rest);
            let (emit, keep) = rest.split_at(rest.len() - held);
            output.extend_from_slice(emit);
            self.pending[stream.index()] = keep.to_vec();
        }

        (output, actions)
    }

    /// Flush anything held back for a stream once it has ended
    pub fn finish(&mut self, stream: Stream) -> Vec<u8> {
        std::mem::take(&mut self.pending[stream.index()])
    }

    fn handle_line(&mut self, line: &[u8]) -> Option<EscalationAction> {
        if contains(line, SUDO_PROMPT.as_bytes()) {
            return Some(match &self.password {
                Some(password) => {
                    self.state = EscalationState::PasswordSent;
                    EscalationAction::SendPassword(format!("{password}\n"))
                }
                None => EscalationAction::Fail(ExecError::escalate(
                    "NO_PASSWORD",
                    format!(
                        "Sudo password for user {} was not provided for {}",
                        self.user, self.target
                    ),
                )),
            });
        }

        if let Some(sudo_id) = &self.sudo_id {
            if line.starts_with(sudo_id.as_bytes()) {
                self.state = EscalationState::Authenticated;
                return Some(EscalationAction::ReleaseStdin);
            }
        }

        let denied = format!("{} is not in the sudoers file.", self.user);
        if line.starts_with(denied.as_bytes()) {
            self.state = EscalationState::Denied;
            return Some(EscalationAction::Fail(ExecError::escalate(
                "SUDO_DENIED",
                format!(
                    "User {} does not have sudo permission on {}",
                    self.user, self.target
                ),
            )));
        }

        if line.starts_with(b"Sorry, try again.") {
            self.state = EscalationState::Rejected;
            return Some(EscalationAction::Fail(ExecError::escalate(
                "BAD_PASSWORD",
                format!(
                    "Sudo password for user {} not recognized on {}",
                    self.user, self.target
                ),
            )));
        }

        None
    }

    /// Length of the trailing bytes that may be the start of a marker
    fn held_suffix(&self, partial: &[u8]) -> usize {
        if let Some(sudo_id) = &self.sudo_id {
            if sudo_id.as_bytes().starts_with(partial) {
                return partial.len();
            }
        }
        let prompt = SUDO_PROMPT.as_bytes();
        (1..=partial.len().min(prompt.len()))
            .rev()
            .find(|&k| prompt.starts_with(&partial[partial.len() - k..]))
            .unwrap_or(0)
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    find(haystack, needle).is_some()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn watcher(password: Option<&str>) -> Escalation {
        Escalation::new(
            "deploy",
            "web1",
            password.map(str::to_string),
            Some("convoy-sudo-1234".to_string()),
        )
    }

    fn issue(action: &EscalationAction) -> &'static str {
        match action {
            EscalationAction::Fail(ExecError::Escalate { code, .. }) => *code,
            other => panic!("expected escalation failure, got {other:?}"),
        }
    }

    #[test]
    fn test_prompt_answered() {
        let mut esc = watcher(Some("hunter2"));
        let (out, actions) = esc.feed(Stream::Stderr, SUDO_PROMPT.as_bytes());
        assert!(out.is_empty());
        assert!(matches!(&actions[..], [EscalationAction::SendPassword(p)] if p == "hunter2\n"));
        assert_eq!(esc.state(), EscalationState::PasswordSent);
    }

    #[test]
    fn test_text_before_prompt_is_kept() {
        let mut esc = watcher(Some("hunter2"));
        let chunk = format!("motd: maintenance at 5\nwarning: {SUDO_PROMPT}");
        let (out, actions) = esc.feed(Stream::Stderr, chunk.as_bytes());
        assert_eq!(out, b"motd: maintenance at 5\nwarning: ");
        assert!(matches!(&actions[..], [EscalationAction::SendPassword(_)]));
        assert_eq!(esc.state(), EscalationState::PasswordSent);
    }

    #[test]
    fn test_prompt_split_across_chunks() {
        let mut esc = watcher(Some("hunter2"));
        let (head, tail) = SUDO_PROMPT.split_at(10);

        let (out, actions) = esc.feed(Stream::Stderr, head.as_bytes());
        assert!(out.is_empty());
        assert!(actions.is_empty());

        let (out, actions) = esc.feed(Stream::Stderr, tail.as_bytes());
        assert!(out.is_empty());
        assert_eq!(actions.len(), 1);
    }

    #[test]
    fn test_no_password() {
        let mut esc = watcher(None);
        let (_, actions) = esc.feed(Stream::Stdout, SUDO_PROMPT.as_bytes());
        assert_eq!(issue(&actions[0]), "NO_PASSWORD");
        if let EscalationAction::Fail(e) = &actions[0] {
            assert_eq!(
                e.to_string(),
                "Sudo password for user deploy was not provided for web1"
            );
        }
    }

    #[test]
    fn test_bad_password() {
        let mut esc = watcher(Some("wrong"));
        esc.feed(Stream::Stderr, SUDO_PROMPT.as_bytes());
        let (_, actions) = esc.feed(Stream::Stderr, b"Sorry, try again.\n");
        assert_eq!(issue(&actions[0]), "BAD_PASSWORD");
        assert_eq!(esc.state(), EscalationState::Rejected);
    }

    #[test]
    fn test_not_in_sudoers() {
        let mut esc = watcher(Some("pw"));
        let (_, actions) = esc.feed(
            Stream::Stderr,
            b"deploy is not in the sudoers file.  This incident will be reported.\n",
        );
        assert_eq!(issue(&actions[0]), "SUDO_DENIED");
        assert_eq!(esc.state(), EscalationState::Denied);
    }

    #[test]
    fn test_correlation_id_releases_stdin() {
        let mut esc = watcher(Some("pw"));
        let (out, actions) = esc.feed(Stream::Stderr, b"convoy-sudo-1234\nreal stderr\n");
        assert_eq!(out, b"real stderr\n");
        assert!(matches!(&actions[..], [EscalationAction::ReleaseStdin]));
        assert_eq!(esc.state(), EscalationState::Authenticated);
    }

    #[test]
    fn test_correlation_id_split_across_chunks() {
        let mut esc = watcher(Some("pw"));
        let (out, actions) = esc.feed(Stream::Stderr, b"convoy-su");
        assert!(out.is_empty());
        assert!(actions.is_empty());
        let (_, actions) = esc.feed(Stream::Stderr, b"do-1234\n");
        assert!(matches!(&actions[..], [EscalationAction::ReleaseStdin]));
    }

    #[test]
    fn test_ordinary_output_passes_through() {
        let mut esc = watcher(Some("pw"));
        let (out, actions) = esc.feed(Stream::Stdout, b"root\npartial");
        assert_eq!(out, b"root\npartial");
        assert!(actions.is_empty());
        assert!(esc.finish(Stream::Stdout).is_empty());
    }

    #[test]
    fn test_held_prefix_flushed_on_finish() {
        let mut esc = watcher(Some("pw"));
        let (out, _) = esc.feed(Stream::Stdout, b"done [su");
        assert_eq!(out, b"done ");
        assert_eq!(esc.finish(Stream::Stdout), b"[su");
    }

    #[test]
    fn test_disabled_passes_everything() {
        let mut esc = Escalation::disabled();
        let (out, actions) = esc.feed(Stream::Stderr, SUDO_PROMPT.as_bytes());
        assert_eq!(out, SUDO_PROMPT.as_bytes());
        assert!(actions.is_empty());
        assert_eq!(esc.state(), EscalationState::NotEscalating);
    }
}
