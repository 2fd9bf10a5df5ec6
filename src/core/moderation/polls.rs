// Poll text extraction for both the stable `m.poll` schema and the legacy
// `org.matrix.msc3381.poll.start` schema.

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollText {
    pub question: String,
    pub answers: Vec<String>,
}

impl PollText {
    pub fn to_text(&self) -> String {
        format!(
            "Question: {}\nAnswers: {}",
            self.question,
            self.answers.join(", ")
        )
    }
}

#[derive(Debug, Deserialize)]
struct StableContent {
    #[serde(rename = "m.poll")]
    poll: Option<StablePoll>,
}

// Question and answers stay raw so one malformed entry can't hide the rest.
#[derive(Debug, Deserialize)]
struct StablePoll {
    #[serde(default)]
    question: Value,
    #[serde(default)]
    answers: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct StableText {
    #[serde(rename = "m.text", default)]
    text: Vec<TextBody>,
}

#[derive(Debug, Deserialize)]
struct TextBody {
    body: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LegacyContent {
    #[serde(rename = "org.matrix.msc3381.poll.start")]
    poll: Option<LegacyPoll>,
}

#[derive(Debug, Deserialize)]
struct LegacyPoll {
    #[serde(default)]
    question: Value,
    #[serde(default)]
    answers: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct LegacyText {
    #[serde(rename = "org.matrix.msc1767.text")]
    text: Option<String>,
}

impl StableText {
    fn first_body(value: &Value) -> Option<String> {
        StableText::deserialize(value)
            .ok()?
            .text
            .into_iter()
            .next()
            .and_then(|t| t.body)
            .filter(|b| !b.is_empty())
    }
}

impl LegacyText {
    fn body(value: &Value) -> Option<String> {
        LegacyText::deserialize(value)
            .ok()?
            .text
            .filter(|b| !b.is_empty())
    }
}

/// Pull the question and answers out of a poll-start content object.
///
/// Returns `None` when neither schema yields any text; such polls are not moderated.
pub fn extract_poll(content: &Value) -> Option<PollText> {
    let mut question = String::new();
    let mut answers = Vec::new();

    if let Ok(StableContent { poll: Some(poll) }) = StableContent::deserialize(content) {
        if let Some(text) = StableText::first_body(&poll.question) {
            question = text;
        }
        answers.extend(poll.answers.iter().filter_map(StableText::first_body));
    }

    if question.is_empty() {
        if let Ok(LegacyContent { poll: Some(poll) }) = LegacyContent::deserialize(content) {
            if let Some(text) = LegacyText::body(&poll.question) {
                question = text;
            }
            answers.extend(poll.answers.iter().filter_map(LegacyText::body));
        }
    }

    if question.is_empty() && answers.is_empty() {
        return None;
    }
    Some(PollText { question, answers })
}
