/// Subjects the tutor knows about. The slug is the stable identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
pub enum TopicId {
    Respiratory,
    Circulatory,
    Digestive,
    Nervous,
    Muscular,
    #[default]
    General,
}

impl TopicId {
    pub fn slug(&self) -> &'static str {
        match self {
            TopicId::Respiratory => "respiratoire",
            TopicId::Circulatory => "circulatoire",
            TopicId::Digestive => "digestif",
            TopicId::Nervous => "nerveux",
            TopicId::Muscular => "musculaire",
            TopicId::General => "general",
        }
    }

    pub fn topic(&self) -> &'static Topic {
        // Every id has exactly one catalog entry
        TOPICS
            .iter()
            .find(|t| t.id == *self)
            .unwrap_or(&TOPICS[TOPICS.len() - 1])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    pub id: TopicId,
    pub title: &'static str,
    pub description: &'static str,
    /// Rendered as-is in front of the title
    pub icon: &'static str,
    pub color: &'static str,
}

pub const TOPICS: [Topic; 6] = [
    Topic {
        id: TopicId::Respiratory,
        title: "Système Respiratoire",
        description: "Comprendre comment l'oxygène entre et comment le CO2 sort.",
        icon: "🫁",
        color: "sky",
    },
    Topic {
        id: TopicId::Circulatory,
        title: "Système Circulatoire",
        description: "Le cœur, le sang et le transport des nutriments.",
        icon: "❤️",
        color: "rose",
    },
    Topic {
        id: TopicId::Digestive,
        title: "Système Digestif",
        description: "De la nourriture à l'énergie : le voyage des aliments.",
        icon: "🍽",
        color: "amber",
    },
    Topic {
        id: TopicId::Nervous,
        title: "Système Nerveux",
        description: "Le cerveau et les commandes électriques du corps.",
        icon: "🧠",
        color: "violet",
    },
    Topic {
        id: TopicId::Muscular,
        title: "Système Musculaire",
        description: "Mouvement, force et interaction avec le squelette.",
        icon: "💪",
        color: "emerald",
    },
    Topic {
        id: TopicId::General,
        title: "Physiologie Générale",
        description: "Introduction globale ou questions variées.",
        icon: "🔬",
        color: "slate",
    },
];

/// Topics whose title or description contains `term`, ignoring case.
/// An empty term matches everything.
pub fn search(term: &str) -> Vec<&'static Topic> {
    let term = term.trim().to_lowercase();
    TOPICS
        .iter()
        .filter(|t| {
            t.title.to_lowercase().contains(&term) || t.description.to_lowercase().contains(&term)
        })
        .collect()
}
