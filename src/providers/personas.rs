use std::collections::HashMap;

use async_trait::async_trait;

use crate::domains::chat::{KnowledgeSnippet, PersonaProfile};
use crate::error::Result;
use crate::interfaces::providers::PersonaSource;

/// Persona catalogue loaded from configuration.
#[derive(Debug, Default, Clone)]
pub struct StaticPersonaSource {
    personas: HashMap<String, PersonaProfile>,
}

impl StaticPersonaSource {
    pub fn new(personas: impl IntoIterator<Item = PersonaProfile>) -> Self {
        Self {
            personas: personas
                .into_iter()
                .map(|persona| (persona.id.clone(), persona))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.personas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.personas.is_empty()
    }
}

#[async_trait]
impl PersonaSource for StaticPersonaSource {
    async fn persona(&self, persona_id: &str) -> Result<Option<PersonaProfile>> {
        Ok(self.personas.get(persona_id).cloned())
    }

    async fn knowledge(&self, persona_id: &str, _query: &str) -> Result<Vec<KnowledgeSnippet>> {
        let mut snippets = self
            .personas
            .get(persona_id)
            .map(|persona| persona.knowledge.clone())
            .unwrap_or_default();
        snippets.sort_by(|a, b| b.relevance.total_cmp(&a.relevance));
        Ok(snippets)
    }
}
