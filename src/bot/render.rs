use teloxide::types::{KeyboardButton, KeyboardMarkup, KeyboardRemove, ReplyMarkup};

use crate::gateway::GatewayError;
use crate::quiz::{QuizPhase, QuizSession, OPTION_COUNT};
use crate::topics::{Topic, TopicId, TOPICS};
use crate::tutor::TutorError;

pub const GREETING_TEXT: &str = "Bonjour ! Je suis BioTutor, votre tuteur en physiologie humaine. Posez n'importe quelle question sur le corps humain ou choisissez un cours structuré.";
pub const API_KEY_PROMPT: &str = "Pour utiliser ce tuteur, j'ai besoin d'une clé API OpenAI. Envoyez-la dans votre prochain message (elle reste en mémoire le temps de la session seulement).";
pub const API_KEY_ACCEPTED: &str = "🔑 Clé enregistrée, c'est parti !";
pub const API_KEY_REJECTED: &str = "Cette clé n'est pas utilisable. Envoyez une autre clé API OpenAI.";
pub const TEXT_ONLY: &str = "Je ne comprends que les messages texte.";
pub const NO_SEARCH_RESULTS: &str = "Aucun sujet ne correspond à votre recherche. /sujets pour tous les voir.";
pub const FOREIGN_CHAT_TEXT: &str = "Ce tuteur est déjà utilisé dans une autre conversation.";
pub const QUIZ_HINT: &str = "Choisissez une réponse avec les boutons.";

pub const BACK_BUTTON: &str = "⬅ Sujets";
pub const QUIZ_BUTTON: &str = "📝 Quiz sur ce sujet";
pub const NEXT_BUTTON: &str = "Suivant ➡";
pub const RESULTS_BUTTON: &str = "Voir les résultats";
pub const RETRY_BUTTON: &str = "🔄 Réessayer";
pub const LEAVE_BUTTON: &str = "Changer de sujet";

const MENU_INTRO: &str =
    "Choisissez un sujet pour un cours ou un quiz, ou écrivez directement votre question :\n";
const OPTION_LETTERS: [&str; OPTION_COUNT] = ["A", "B", "C", "D"];

/// A message to send together with its reply keyboard.
#[derive(Debug, Clone, PartialEq)]
pub struct View {
    pub text: String,
    /// No rows means the keyboard is removed.
    pub buttons: Vec<Vec<String>>,
}

impl View {
    fn new(text: impl Into<String>, buttons: Vec<Vec<&str>>) -> Self {
        Self {
            text: text.into(),
            buttons: buttons
                .into_iter()
                .map(|row| row.into_iter().map(str::to_string).collect())
                .collect(),
        }
    }

    pub fn markup(&self) -> ReplyMarkup {
        if self.buttons.is_empty() {
            return KeyboardRemove::new().into();
        }
        KeyboardMarkup::new(
            self.buttons
                .iter()
                .map(|row| {
                    row.iter()
                        .map(|label| KeyboardButton::new(label.clone()))
                        .collect::<Vec<_>>()
                })
                .collect::<Vec<_>>(),
        )
        .into()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicChoice {
    Learn(TopicId),
    Quiz(TopicId),
}

pub fn learn_label(topic: &Topic) -> String {
    format!("{} {}", topic.icon, topic.title)
}

pub fn quiz_label(topic: &Topic) -> String {
    format!("Quiz · {}", topic.title)
}

/// Maps a pressed menu button back to its topic. Anything else is free text.
pub fn parse_topic_choice(text: &str) -> Option<TopicChoice> {
    let text = text.trim();
    TOPICS.iter().find_map(|topic| {
        if text == learn_label(topic) {
            Some(TopicChoice::Learn(topic.id))
        } else if text == quiz_label(topic) {
            Some(TopicChoice::Quiz(topic.id))
        } else {
            None
        }
    })
}

pub fn topic_menu(topics: &[&Topic]) -> View {
    let mut text = String::from(MENU_INTRO);
    for topic in topics {
        text.push_str(&format!(
            "\n{} {} : {}",
            topic.icon, topic.title, topic.description
        ));
    }
    View {
        text,
        buttons: topics
            .iter()
            .map(|topic| vec![learn_label(topic), quiz_label(topic)])
            .collect(),
    }
}

pub fn lesson_view(topic: TopicId) -> View {
    let topic = topic.topic();
    View::new(
        format!("{} {}", topic.icon, topic.title),
        vec![vec![QUIZ_BUTTON], vec![BACK_BUTTON]],
    )
}

pub fn quiz_loading_view(topic: TopicId) -> View {
    View::new(
        format!(
            "Préparation de votre quiz...\nL'IA génère des questions sur {}",
            topic.topic().title
        ),
        Vec::new(),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuizAction {
    Choose(usize),
    Next,
    Retry,
    Leave,
}

impl QuizAction {
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if let Some(index) = OPTION_LETTERS
            .iter()
            .position(|letter| letter.eq_ignore_ascii_case(text))
        {
            return Some(QuizAction::Choose(index));
        }
        match text {
            NEXT_BUTTON | RESULTS_BUTTON => Some(QuizAction::Next),
            RETRY_BUTTON => Some(QuizAction::Retry),
            LEAVE_BUTTON | BACK_BUTTON => Some(QuizAction::Leave),
            _ => None,
        }
    }
}

pub fn quiz_view(quiz: &QuizSession) -> View {
    match quiz.phase() {
        QuizPhase::Loading => quiz_loading_view(quiz.topic()),
        QuizPhase::Failed(message) => View::new(*message, vec![vec![RETRY_BUTTON, LEAVE_BUTTON]]),
        QuizPhase::Finished => View::new(
            format!(
                "🏆 Quiz terminé !\nVotre score : {} / {}\n\n« {} »",
                quiz.score(),
                quiz.questions().len(),
                quiz.feedback().message()
            ),
            vec![vec![RETRY_BUTTON, LEAVE_BUTTON]],
        ),
        QuizPhase::InProgress => question_view(quiz),
    }
}

fn question_view(quiz: &QuizSession) -> View {
    let Some(question) = quiz.current_question() else {
        return View::new(QUIZ_HINT, vec![vec![LEAVE_BUTTON]]);
    };

    let mut text = format!(
        "Question {} / {}\n\n{}\n",
        quiz.current_index() + 1,
        quiz.questions().len(),
        question.question
    );
    for (i, option) in question.options.iter().enumerate() {
        let mark = match quiz.selected_option() {
            Some(_) if i == question.correct_answer_index => " ✅",
            Some(selected) if selected == i => " ❌",
            _ => "",
        };
        text.push_str(&format!("\n{}. {}{}", OPTION_LETTERS[i], option, mark));
    }

    let Some(selected) = quiz.selected_option() else {
        return View::new(text, vec![OPTION_LETTERS.to_vec(), vec![LEAVE_BUTTON]]);
    };

    if selected == question.correct_answer_index {
        text.push_str("\n\nBonne réponse !");
    } else {
        text.push_str(&format!(
            "\n\nMauvaise réponse. La bonne réponse était {}.",
            OPTION_LETTERS[question.correct_answer_index]
        ));
    }
    text.push_str(&format!("\n\n💡 Explication : {}", question.explanation));

    let next = if quiz.is_last_question() {
        RESULTS_BUTTON
    } else {
        NEXT_BUTTON
    };
    View::new(text, vec![vec![next], vec![LEAVE_BUTTON]])
}

pub fn error_text(err: &TutorError) -> &'static str {
    match err {
        TutorError::Busy => "⏳ Patientez, je termine ma réponse...",
        TutorError::EmptyInput => "Écrivez votre question en texte.",
        TutorError::NoQuiz => "Aucun quiz en cours. /sujets pour en choisir un.",
        TutorError::Gateway(GatewayError::SessionInit(_)) => {
            "🔑 Aucune clé API utilisable n'est configurée. Envoyez /cle suivi de votre clé."
        }
        TutorError::Gateway(_) => crate::gateway::FALLBACK_FRAGMENT,
    }
}
