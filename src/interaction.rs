//! Client-side bookkeeping for answering prompts.
//!
//! An observer presents one thing at a time: a batch of questions, a
//! permission request, a plan, or a plain message. [`InteractionState`]
//! tracks which one, accumulates answers across a question batch and
//! multi-select toggles, and turns each step into the [`Submission`] the
//! engine expects. Nothing here is shared between observers.

use std::collections::BTreeSet;

use thiserror::Error;

use crate::keys::{Action, Submission};
use crate::pending::PendingRequest;
use crate::transcript::{MessageBody, Question, SemanticMessage};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InteractionError {
    #[error("nothing is being presented")]
    NothingPresented,
    #[error("the presented prompt does not accept this response")]
    WrongPrompt,
    #[error("option {option} is out of range (1..={count})")]
    OptionOutOfRange { option: usize, count: usize },
    #[error("question is not multi-select")]
    NotMultiSelect,
    #[error("no options selected")]
    NothingSelected,
    #[error("all questions are already answered")]
    BatchComplete,
}

/// Answer recorded for one question of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Answer {
    Choice(usize),
    Multi(Vec<usize>),
    Other(String),
}

#[derive(Debug, Clone)]
enum Presenting {
    Questions {
        tool_use_id: String,
        questions: Vec<Question>,
        answers: Vec<Answer>,
        toggled: BTreeSet<usize>,
    },
    Permission {
        tool_use_id: String,
    },
    Plan {
        tool_use_id: String,
    },
    Message {
        id: String,
    },
}

#[derive(Debug, Clone, Default)]
pub struct InteractionState {
    presenting: Option<Presenting>,
}

impl InteractionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn present_questions(&mut self, tool_use_id: &str, questions: Vec<Question>) {
        self.presenting = Some(Presenting::Questions {
            tool_use_id: tool_use_id.to_string(),
            questions,
            answers: Vec::new(),
            toggled: BTreeSet::new(),
        });
    }

    pub fn present_permission(&mut self, request: &PendingRequest) {
        self.presenting = Some(Presenting::Permission {
            tool_use_id: request.tool_use_id.clone(),
        });
    }

    pub fn present_plan(&mut self, tool_use_id: &str) {
        self.presenting = Some(Presenting::Plan {
            tool_use_id: tool_use_id.to_string(),
        });
    }

    /// Present whatever `message` asks of the user.
    ///
    /// Question messages of the same batch are grouped by the caller; a
    /// lone question message is presented as a one-question batch.
    pub fn present_message(&mut self, message: &SemanticMessage) {
        match &message.body {
            MessageBody::Question {
                tool_use_id,
                question,
                ..
            } => self.present_questions(tool_use_id, vec![question.clone()]),
            MessageBody::PlanApproval { tool_use_id, .. } => self.present_plan(tool_use_id),
            _ => {
                self.presenting = Some(Presenting::Message {
                    id: message.id.clone(),
                })
            }
        }
    }

    /// Id of the tool use (or message) being presented.
    pub fn presenting_id(&self) -> Option<&str> {
        match self.presenting.as_ref()? {
            Presenting::Questions { tool_use_id, .. }
            | Presenting::Permission { tool_use_id }
            | Presenting::Plan { tool_use_id } => Some(tool_use_id),
            Presenting::Message { id } => Some(id),
        }
    }

    pub fn clear(&mut self) {
        self.presenting = None;
    }

    pub fn current_question(&self) -> Option<&Question> {
        match self.presenting.as_ref()? {
            Presenting::Questions {
                questions, answers, ..
            } => questions.get(answers.len()),
            _ => None,
        }
    }

    /// Zero-based index of the current question in its batch.
    pub fn current_index(&self) -> Option<usize> {
        match self.presenting.as_ref()? {
            Presenting::Questions {
                questions, answers, ..
            } if answers.len() < questions.len() => Some(answers.len()),
            _ => None,
        }
    }

    pub fn answers(&self) -> &[Answer] {
        match &self.presenting {
            Some(Presenting::Questions { answers, .. }) => answers,
            _ => &[],
        }
    }

    pub fn toggled(&self) -> Vec<usize> {
        match &self.presenting {
            Some(Presenting::Questions { toggled, .. }) => toggled.iter().copied().collect(),
            _ => Vec::new(),
        }
    }

    /// Every question of the presented batch has an answer.
    pub fn is_complete(&self) -> bool {
        match &self.presenting {
            Some(Presenting::Questions {
                questions, answers, ..
            }) => answers.len() >= questions.len(),
            _ => false,
        }
    }

    /// Flip a multi-select option (1-based); returns whether it is now selected.
    pub fn toggle(&mut self, option: usize) -> Result<bool, InteractionError> {
        let question = self.open_question()?;
        if !question.multi_select {
            return Err(InteractionError::NotMultiSelect);
        }
        check_option(option, question.options.len())?;

        let Some(Presenting::Questions { toggled, .. }) = self.presenting.as_mut() else {
            return Err(InteractionError::WrongPrompt);
        };
        if toggled.remove(&option) {
            Ok(false)
        } else {
            toggled.insert(option);
            Ok(true)
        }
    }

    /// Pick option `option` (1-based) of the current single-select question.
    pub fn choose(&mut self, option: usize) -> Result<Submission, InteractionError> {
        let question = self.open_question()?;
        check_option(option, question.options.len())?;
        self.record(Answer::Choice(option));
        Ok(Submission::action(Action::Answer, option.to_string()))
    }

    /// Submit the toggled options of the current multi-select question.
    pub fn submit_multi(&mut self) -> Result<Submission, InteractionError> {
        let question = self.open_question()?;
        if !question.multi_select {
            return Err(InteractionError::NotMultiSelect);
        }
        let selected = self.toggled();
        if selected.is_empty() {
            return Err(InteractionError::NothingSelected);
        }
        let text = selected
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        self.record(Answer::Multi(selected));
        Ok(Submission::action(Action::AnswerMulti, text))
    }

    /// Answer the current question with free text instead of an option.
    pub fn other(&mut self, text: &str) -> Result<Submission, InteractionError> {
        let count = self.open_question()?.options.len();
        self.record(Answer::Other(text.to_string()));
        Ok(Submission::action(Action::Other, format!("{count}:{text}")))
    }

    /// Allow the presented permission request, once or for the session.
    pub fn approve_permission(&mut self, always: bool) -> Result<Submission, InteractionError> {
        self.take_permission()?;
        let choice = if always { "2" } else { "1" };
        Ok(Submission::action(Action::Permission, choice))
    }

    pub fn deny_permission(&mut self) -> Result<Submission, InteractionError> {
        self.take_permission()?;
        Ok(Submission::action(Action::Permission, "Escape"))
    }

    pub fn approve_plan(&mut self) -> Result<Submission, InteractionError> {
        self.take_plan()?;
        Ok(Submission::action(Action::Approve, ""))
    }

    pub fn reject_plan(&mut self) -> Result<Submission, InteractionError> {
        self.take_plan()?;
        Ok(Submission::action(Action::Reject, ""))
    }

    fn open_question(&self) -> Result<&Question, InteractionError> {
        match &self.presenting {
            None => Err(InteractionError::NothingPresented),
            Some(Presenting::Questions {
                questions, answers, ..
            }) => questions
                .get(answers.len())
                .ok_or(InteractionError::BatchComplete),
            Some(_) => Err(InteractionError::WrongPrompt),
        }
    }

    fn record(&mut self, answer: Answer) {
        if let Some(Presenting::Questions {
            answers, toggled, ..
        }) = self.presenting.as_mut()
        {
            answers.push(answer);
            toggled.clear();
        }
    }

    fn take_permission(&mut self) -> Result<(), InteractionError> {
        match &self.presenting {
            None => Err(InteractionError::NothingPresented),
            Some(Presenting::Permission { .. }) => {
                self.presenting = None;
                Ok(())
            }
            Some(_) => Err(InteractionError::WrongPrompt),
        }
    }

    fn take_plan(&mut self) -> Result<(), InteractionError> {
        match &self.presenting {
            None => Err(InteractionError::NothingPresented),
            Some(Presenting::Plan { .. }) => {
                self.presenting = None;
                Ok(())
            }
            Some(_) => Err(InteractionError::WrongPrompt),
        }
    }
}

fn check_option(option: usize, count: usize) -> Result<(), InteractionError> {
    if (1..=count).contains(&option) {
        Ok(())
    } else {
        Err(InteractionError::OptionOutOfRange { option, count })
    }
}
