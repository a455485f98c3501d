pub mod schema;

use log::{debug, warn};

use crate::gateway::{backend::ModelBackend, GatewayError, ModelGateway, QuizFuture};
use crate::topics::TopicId;

pub const QUIZ_LENGTH: usize = 5;
pub const OPTION_COUNT: usize = 4;

pub const LOAD_ERROR: &str = "Impossible de charger le quiz. Veuillez réessayer.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuizQuestion {
    pub question: String,
    pub options: [String; OPTION_COUNT],
    pub correct_answer_index: usize,
    pub explanation: String,
}

impl QuizQuestion {
    #[cfg(test)]
    pub fn correct_answer(&self) -> &str {
        &self.options[self.correct_answer_index]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuizPhase {
    Loading,
    InProgress,
    Finished,
    Failed(&'static str),
}

/// End-of-quiz verdict, by percentage of correct answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feedback {
    PerfectMastery,
    VeryGood,
    NeedsMinorReview,
    NeedsChapterReview,
}

impl Feedback {
    /// Tiers: 100%, [80, 100), [50, 80), below 50.
    pub fn from_score(score: usize, total: usize) -> Self {
        if total == 0 {
            return Feedback::NeedsChapterReview;
        }
        // Integer comparison of score / total * 100 against each bound
        let percent_times_total = score * 100;
        if score >= total {
            Feedback::PerfectMastery
        } else if percent_times_total >= 80 * total {
            Feedback::VeryGood
        } else if percent_times_total >= 50 * total {
            Feedback::NeedsMinorReview
        } else {
            Feedback::NeedsChapterReview
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Feedback::PerfectMastery => "Excellent ! Maîtrise parfaite.",
            Feedback::VeryGood => "Très bien ! Encore un petit effort.",
            Feedback::NeedsMinorReview => "Pas mal, mais des révisions sont nécessaires.",
            Feedback::NeedsChapterReview => "Il faut revoir ce chapitre.",
        }
    }
}

/// One run through a generated quiz.
///
/// `Loading -> InProgress -> Finished`, or `Loading -> Failed`. While in
/// progress each question is first unanswered, then answered once; the first
/// answer is final.
#[derive(Debug, Clone)]
pub struct QuizSession {
    topic: TopicId,
    questions: Vec<QuizQuestion>,
    current_index: usize,
    selected_option: Option<usize>,
    score: usize,
    phase: QuizPhase,
}

impl QuizSession {
    pub fn new(topic: TopicId) -> Self {
        Self {
            topic,
            questions: Vec::new(),
            current_index: 0,
            selected_option: None,
            score: 0,
            phase: QuizPhase::Loading,
        }
    }

    /// Clears every answer and returns to `Loading`. The returned round trip
    /// is applied with [`QuizSession::apply_loaded`] once it completes.
    pub fn begin_load<B: ModelBackend>(&mut self, gateway: &ModelGateway<B>) -> QuizFuture {
        debug!("Loading quiz on {}", self.topic.slug());
        *self = Self::new(self.topic);
        gateway.generate_quiz(self.topic.topic().title)
    }

    /// Loads in one step, for callers that own the gateway for the whole trip.
    #[cfg(test)]
    pub async fn load<B: ModelBackend>(&mut self, gateway: &ModelGateway<B>) {
        let pending = self.begin_load(gateway);
        self.apply_loaded(pending.await);
    }

    pub fn apply_loaded(&mut self, result: Result<Vec<QuizQuestion>, GatewayError>) {
        if self.phase != QuizPhase::Loading {
            debug!("Quiz on {} is not loading, dropping the result", self.topic.slug());
            return;
        }
        match result {
            Ok(questions) if !questions.is_empty() => {
                self.questions = questions;
                self.phase = QuizPhase::InProgress;
            }
            Ok(_) => {
                warn!("Quiz generation returned no questions");
                self.phase = QuizPhase::Failed(LOAD_ERROR);
            }
            Err(err) => {
                warn!("Quiz on {} could not be loaded: {}", self.topic.slug(), err);
                self.phase = QuizPhase::Failed(LOAD_ERROR);
            }
        }
    }

    /// Records the answer to the current question. Returns whether it was
    /// correct, or `None` when no answer can be taken right now.
    pub fn select_option(&mut self, index: usize) -> Option<bool> {
        if self.phase != QuizPhase::InProgress || self.is_answered() || index >= OPTION_COUNT {
            return None;
        }
        let correct = index == self.questions[self.current_index].correct_answer_index;
        self.selected_option = Some(index);
        if correct {
            self.score += 1;
        }
        Some(correct)
    }

    /// Moves past an answered question. Returns `false` when nothing happened.
    pub fn advance(&mut self) -> bool {
        if self.phase != QuizPhase::InProgress || !self.is_answered() {
            return false;
        }
        if self.is_last_question() {
            self.phase = QuizPhase::Finished;
        } else {
            self.current_index += 1;
            self.selected_option = None;
        }
        true
    }

    pub fn topic(&self) -> TopicId {
        self.topic
    }

    pub fn phase(&self) -> &QuizPhase {
        &self.phase
    }

    pub fn questions(&self) -> &[QuizQuestion] {
        &self.questions
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn current_question(&self) -> Option<&QuizQuestion> {
        match self.phase {
            QuizPhase::InProgress => self.questions.get(self.current_index),
            _ => None,
        }
    }

    pub fn selected_option(&self) -> Option<usize> {
        self.selected_option
    }

    pub fn is_answered(&self) -> bool {
        self.selected_option.is_some()
    }

    pub fn is_last_question(&self) -> bool {
        self.current_index + 1 >= self.questions.len()
    }

    #[cfg(test)]
    pub fn is_finished(&self) -> bool {
        self.phase == QuizPhase::Finished
    }

    pub fn score(&self) -> usize {
        self.score
    }

    pub fn feedback(&self) -> Feedback {
        Feedback::from_score(self.score, self.questions.len())
    }
}
