use std::sync::Arc;

use futures::StreamExt;

use crate::error::GenerationError;
use crate::llm::CompletionApi;
use crate::models::{RetrievedItem, Turn};

const SYSTEM_PROMPT: &str = "You are a helpful assistant that answers questions based on the provided news articles context. \
Use only the information from the context to answer. If the context doesn't contain relevant information, \
say so politely. Be concise and accurate.";

/// Grounded answer generation on top of a completion provider.
pub struct Generator {
    api: Arc<dyn CompletionApi>,
}

impl Generator {
    pub fn new(api: Arc<dyn CompletionApi>) -> Self {
        Self { api }
    }

    pub async fn generate(
        &self,
        query: &str,
        context: &[RetrievedItem],
        history: &[Turn],
    ) -> Result<String, GenerationError> {
        let prompt = build_prompt(query, context, history);
        self.api.complete(&prompt).await.map_err(|e| {
            tracing::error!("Error generating response: {}", e);
            e
        })
    }

    /// Calls `on_fragment` once per fragment, in arrival order, and returns
    /// their concatenation.
    pub async fn generate_streaming<F>(
        &self,
        query: &str,
        context: &[RetrievedItem],
        history: &[Turn],
        mut on_fragment: F,
    ) -> Result<String, GenerationError>
    where
        F: FnMut(&str) + Send,
    {
        let prompt = build_prompt(query, context, history);
        let mut fragments = self.api.complete_stream(&prompt).await.map_err(|e| {
            tracing::error!("Error starting streaming response: {}", e);
            e
        })?;

        let mut full_response = String::new();
        while let Some(fragment) = fragments.next().await {
            let fragment = fragment.map_err(|e| {
                tracing::error!("Error in streaming response: {}", e);
                e
            })?;
            if fragment.is_empty() {
                continue;
            }
            full_response.push_str(&fragment);
            on_fragment(&fragment);
        }
        Ok(full_response)
    }
}

/// Preamble, numbered articles, prior turns in order, then the question.
pub fn build_prompt(query: &str, context: &[RetrievedItem], history: &[Turn]) -> String {
    let context_text = context
        .iter()
        .enumerate()
        .map(|(idx, item)| format!("[Article {}]\n{}\n", idx + 1, item.content))
        .collect::<Vec<_>>()
        .join("\n---\n\n");

    let history_text = if history.is_empty() {
        String::new()
    } else {
        let lines = history
            .iter()
            .map(|turn| format!("{}: {}", turn.role.label(), turn.content))
            .collect::<Vec<_>>()
            .join("\n");
        format!("\n\nPrevious conversation:\n{}", lines)
    };

    format!(
        "{}\n\nContext from news articles:\n{}\n\n{}\n\nUser question: {}\n\nAssistant:",
        SYSTEM_PROMPT, context_text, history_text, query
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::FragmentStream;
    use crate::models::{ArticleMetadata, Role};
    use async_trait::async_trait;
    use futures::stream;
    use std::sync::Mutex;

    struct ScriptedLlm {
        fragments: Vec<Result<String, GenerationError>>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedLlm {
        fn new(fragments: Vec<Result<String, GenerationError>>) -> Arc<Self> {
            Arc::new(Self {
                fragments,
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CompletionApi for ScriptedLlm {
        async fn complete(&self, prompt: &str) -> Result<String, GenerationError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            Ok("blocking answer".to_string())
        }

        async fn complete_stream(&self, prompt: &str) -> Result<FragmentStream, GenerationError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            let fragments: Vec<_> = self
                .fragments
                .iter()
                .map(|f| match f {
                    Ok(text) => Ok(text.clone()),
                    Err(_) => Err(GenerationError::Malformed("stream broke".into())),
                })
                .collect();
            Ok(stream::iter(fragments).boxed())
        }
    }

    fn item(content: &str) -> RetrievedItem {
        RetrievedItem {
            content: content.to_string(),
            metadata: ArticleMetadata::default(),
            distance: 0.1,
        }
    }

    #[test]
    fn test_prompt_sections_in_order() {
        let history = vec![
            Turn::new(Role::User, "Who won?"),
            Turn::new(Role::Assistant, "The home team."),
        ];
        let prompt = build_prompt(
            "By how much?",
            &[item("Match report"), item("League table")],
            &history,
        );

        let positions: Vec<usize> = [
            "answers questions based on the provided news articles",
            "[Article 1]\nMatch report",
            "[Article 2]\nLeague table",
            "User: Who won?",
            "Assistant: The home team.",
            "User question: By how much?",
        ]
        .iter()
        .map(|needle| prompt.find(needle).unwrap_or_else(|| panic!("missing {:?}", needle)))
        .collect();

        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{:?}", positions);
        assert!(prompt.ends_with("Assistant:"));
    }

    #[test]
    fn test_prompt_without_history_has_no_conversation_block() {
        let prompt = build_prompt("q", &[item("c")], &[]);
        assert!(!prompt.contains("Previous conversation"));
    }

    #[tokio::test]
    async fn test_streaming_concatenation_equals_result() {
        let llm = ScriptedLlm::new(vec![
            Ok("Markets ".into()),
            Ok("".into()),
            Ok("closed ".into()),
            Ok("higher.".into()),
        ]);
        let generator = Generator::new(llm.clone());

        let mut seen = Vec::new();
        let answer = generator
            .generate_streaming("q", &[item("c")], &[], |f| seen.push(f.to_string()))
            .await
            .unwrap();

        assert_eq!(seen, vec!["Markets ", "closed ", "higher."]);
        assert_eq!(seen.concat(), answer);
        assert_eq!(llm.prompts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stream_failure_propagates() {
        let llm = ScriptedLlm::new(vec![
            Ok("partial".into()),
            Err(GenerationError::Malformed("x".into())),
        ]);
        let generator = Generator::new(llm);

        let mut seen = Vec::new();
        let result = generator
            .generate_streaming("q", &[item("c")], &[], |f| seen.push(f.to_string()))
            .await;

        assert!(result.is_err());
        assert_eq!(seen, vec!["partial"]);
    }

    #[tokio::test]
    async fn test_blocking_generate_uses_prompt() {
        let llm = ScriptedLlm::new(vec![]);
        let generator = Generator::new(llm.clone());
        let answer = generator.generate("what?", &[item("ctx")], &[]).await.unwrap();
        assert_eq!(answer, "blocking answer");
        assert!(llm.prompts.lock().unwrap()[0].contains("User question: what?"));
    }
}
