//! Phase computation from persisted state.

use taskforge_core::{Message, MessageSource, Phase, Task};

/// Where a task stands, with the pivot message for the active phases.
#[derive(Debug, Clone)]
pub enum Status {
    AwaitInput,
    Suspended,
    InvokeModel { pivot: Message, history: Vec<Message> },
    ExecuteTools { pivot: Message, history: Vec<Message> },
}

impl Status {
    pub fn phase(&self) -> Phase {
        match self {
            Self::AwaitInput => Phase::AwaitInput,
            Self::Suspended => Phase::Suspended,
            Self::InvokeModel { .. } => Phase::InvokeModel,
            Self::ExecuteTools { .. } => Phase::ExecuteTools,
        }
    }

    pub fn pivot(&self) -> Option<&Message> {
        match self {
            Self::InvokeModel { pivot, .. } | Self::ExecuteTools { pivot, .. } => Some(pivot),
            _ => None,
        }
    }
}

/// Sources in the order their unprocessed messages are drained.
const PRIORITY: [MessageSource; 3] = [
    MessageSource::System,
    MessageSource::Assistant,
    MessageSource::User,
];

/// Compute the status of `task` from its ordered message list.
///
/// Suspension wins over everything. Otherwise the earliest unprocessed
/// message of the highest-priority source becomes the pivot and every
/// processed message is history.
pub fn compute_status(task: &Task, messages: Vec<Message>) -> Status {
    if task.is_suspended() {
        return Status::Suspended;
    }

    let (history, pending): (Vec<Message>, Vec<Message>) =
        messages.into_iter().partition(Message::is_processed);

    let Some(pivot) = PRIORITY
        .iter()
        .find_map(|source| pending.iter().find(|m| m.source == *source))
        .cloned()
    else {
        return Status::AwaitInput;
    };

    match pivot.source {
        MessageSource::Assistant => Status::ExecuteTools { pivot, history },
        MessageSource::System | MessageSource::User => Status::InvokeModel { pivot, history },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskforge_core::{ContentBlock, DesiredPhase, TaskId};

    fn task() -> Task {
        Task::new("agent", "/tmp")
    }

    fn tool_call(task: &TaskId) -> Message {
        Message::assistant(
            task.clone(),
            vec![ContentBlock::CodeInterpreterCall {
                id: "c1".into(),
                script: "1".into(),
            }],
        )
    }

    #[test]
    fn no_messages_awaits_input() {
        assert!(matches!(compute_status(&task(), vec![]), Status::AwaitInput));
    }

    #[test]
    fn all_processed_awaits_input() {
        let t = task();
        let messages = vec![
            Message::user(t.id.clone(), "hi").processed(),
            Message::assistant(t.id.clone(), vec![ContentBlock::text("hello")]).processed(),
        ];
        assert!(matches!(compute_status(&t, messages), Status::AwaitInput));
    }

    #[test]
    fn suspension_preempts_pending_messages() {
        let mut t = task();
        t.desired_phase = DesiredPhase::Suspended;
        let messages = vec![Message::user(t.id.clone(), "do it")];
        assert_eq!(compute_status(&t, messages).phase(), Phase::Suspended);
    }

    #[test]
    fn user_message_invokes_model() {
        let t = task();
        let first = Message::user(t.id.clone(), "first").processed();
        let pending = Message::user(t.id.clone(), "second");
        match compute_status(&t, vec![first.clone(), pending.clone()]) {
            Status::InvokeModel { pivot, history } => {
                assert_eq!(pivot.id, pending.id);
                assert_eq!(history.len(), 1);
                assert_eq!(history[0].id, first.id);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn assistant_message_executes_tools() {
        let t = task();
        let call = tool_call(&t.id);
        let status = compute_status(&t, vec![call.clone()]);
        assert_eq!(status.phase(), Phase::ExecuteTools);
        assert_eq!(status.pivot().map(|m| m.id.as_str()), Some(call.id.as_str()));
    }

    #[test]
    fn system_beats_assistant_beats_user() {
        let t = task();
        let user = Message::user(t.id.clone(), "next question");
        let assistant = tool_call(&t.id);
        let system = Message::system(t.id.clone(), vec![ContentBlock::text("cancelled")]);

        let status = compute_status(&t, vec![user.clone(), assistant.clone(), system.clone()]);
        assert_eq!(status.pivot().map(|m| m.id.clone()), Some(system.id));

        let status = compute_status(&t, vec![user.clone(), assistant.clone()]);
        assert_eq!(status.pivot().map(|m| m.id.clone()), Some(assistant.id));

        let status = compute_status(&t, vec![user.clone()]);
        assert_eq!(status.pivot().map(|m| m.id.clone()), Some(user.id));
    }

    #[test]
    fn earliest_pending_of_a_source_is_chosen() {
        let t = task();
        let a = Message::user(t.id.clone(), "a");
        let b = Message::user(t.id.clone(), "b");
        let status = compute_status(&t, vec![a.clone(), b]);
        assert_eq!(status.pivot().map(|m| m.id.clone()), Some(a.id));
    }
}
