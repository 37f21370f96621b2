//! Ephemeral "is typing" flag for the composer.
//!
//! The first keystroke raises the flag, every keystroke pushes the idle
//! deadline out by [`TYPING_IDLE_MS`], and the flag drops once the deadline
//! passes.  Callers drive time explicitly so the signal stays deterministic.

pub const TYPING_IDLE_MS: u64 = 2_000;

#[derive(Debug, Default)]
pub struct TypingSignal {
    typing: bool,
    deadline: Option<u64>,
}

impl TypingSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_typing(&self) -> bool {
        self.typing
    }

    /// Returns `Some(true)` when the flag must be written.
    pub fn on_keystroke(&mut self, now_ms: u64) -> Option<bool> {
        self.deadline = Some(now_ms.saturating_add(TYPING_IDLE_MS));
        if self.typing {
            return None;
        }
        self.typing = true;
        Some(true)
    }

    /// Returns `Some(false)` when the idle deadline has passed.
    pub fn poll(&mut self, now_ms: u64) -> Option<bool> {
        match self.deadline {
            Some(deadline) if self.typing && now_ms >= deadline => self.stop(),
            _ => None,
        }
    }

    /// Drop the flag right away (message sent, conversation closed).
    pub fn stop(&mut self) -> Option<bool> {
        self.deadline = None;
        if !self.typing {
            return None;
        }
        self.typing = false;
        Some(false)
    }
}
