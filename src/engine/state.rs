//! Conversation states and the transition table between them.
//!
//! `transition` is total: every (state, event) pair yields exactly one
//! next state. Pairs with no effect are listed explicitly as no-ops.
//!
//! In open-mic mode the service detects the end of the user's turn and
//! never tells the client, so there is no `TurnCommitted` and the first
//! reply moves `Listening` straight to `Speaking`. `Processing` is only
//! entered by turns the client commits itself (text, greeting, wake word).

use serde::Serialize;
use strum::{Display, EnumIter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, EnumIter)]
pub enum ConversationState {
    Idle,
    Listening,
    Processing,
    Speaking,
}

impl ConversationState {
    pub fn status_text(self, wake_mode: bool) -> &'static str {
        match self {
            ConversationState::Idle if wake_mode => "Waiting for wake word",
            ConversationState::Idle => "Ready",
            ConversationState::Listening => "Listening...",
            ConversationState::Processing => "Thinking...",
            ConversationState::Speaking => "Speaking...",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum ConversationEvent {
    WakeDetected,
    TalkPressed,
    TurnCommitted,
    /// First reply audio or text of a turn
    ReplyArrived,
    PlaybackFinished,
    /// Barge-in: new user speech
    SpeechDetected,
    ChannelError,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConversationState,
    pub to: ConversationState,
    /// Silence everything the scheduler holds
    pub cancel_playback: bool,
}

impl Transition {
    pub fn is_noop(&self) -> bool {
        self.from == self.to && !self.cancel_playback
    }
}

pub fn transition(from: ConversationState, event: ConversationEvent) -> Transition {
    use ConversationEvent as E;
    use ConversationState as S;

    let (to, cancel_playback) = match (from, event) {
        (S::Idle, E::WakeDetected | E::TalkPressed | E::SpeechDetected) => (S::Listening, false),
        (S::Idle, E::TurnCommitted) => (S::Processing, false),
        (S::Idle, E::ReplyArrived) => (S::Speaking, false),
        (S::Idle, E::PlaybackFinished | E::ChannelError | E::Stop) => (S::Idle, false),

        (S::Listening, E::WakeDetected | E::TalkPressed | E::SpeechDetected) => {
            (S::Listening, false)
        }
        (S::Listening, E::TurnCommitted) => (S::Processing, false),
        (S::Listening, E::ReplyArrived) => (S::Speaking, false),
        (S::Listening, E::PlaybackFinished) => (S::Listening, false),
        (S::Listening, E::ChannelError | E::Stop) => (S::Idle, false),

        (S::Processing, E::ReplyArrived) => (S::Speaking, false),
        (
            S::Processing,
            E::WakeDetected
            | E::TalkPressed
            | E::TurnCommitted
            | E::PlaybackFinished
            | E::SpeechDetected,
        ) => (S::Processing, false),
        (S::Processing, E::ChannelError | E::Stop) => (S::Idle, true),

        (S::Speaking, E::WakeDetected | E::TalkPressed | E::SpeechDetected) => {
            (S::Listening, true)
        }
        (S::Speaking, E::TurnCommitted) => (S::Processing, true),
        (S::Speaking, E::ReplyArrived) => (S::Speaking, false),
        (S::Speaking, E::PlaybackFinished) => (S::Idle, false),
        (S::Speaking, E::ChannelError | E::Stop) => (S::Idle, true),
    };

    Transition {
        from,
        to,
        cancel_playback,
    }
}
