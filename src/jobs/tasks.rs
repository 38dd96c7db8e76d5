//! Session tasks: the concrete work behind each `JobType`.
//!
//! All kinds share one shape: extract gathers the material (the source
//! text or the session so far), analyze condenses it, generate calls the
//! model, finalize parses the output and writes the session. The session is
//! only written in finalize, so a failed job never leaves half a round behind.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use uuid::Uuid;

use super::model::JobType;
use super::runner::{JobTask, StepContext};
use crate::error::JobError;
use crate::llm::{ChatMessage, CompletionRequest};
use crate::store::{Session, SessionStore};

const MATERIAL: &str = "material";
const ANALYSIS: &str = "analysis";
const OUTPUT: &str = "output";

const DEFAULT_QUESTION_COUNT: u32 = 5;
const MAX_MATERIAL_CHARS: usize = 24_000;
const ANALYSIS_MAX_TOKENS: u32 = 1024;
const GENERATION_MAX_TOKENS: u32 = 2048;

const QUESTION_RULES: &str = "Rules:\n\
    - One question per line, no numbering, no extra commentary\n\
    - Each question must be answerable from the material\n\
    - Vary difficulty and question style";

/// What the caller asked for. Deserialized straight from the REST body.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum TaskRequest {
    CreateSession {
        title: String,
        source: String,
        #[serde(default)]
        count: Option<u32>,
    },
    SubmitAnswers {
        session_id: Uuid,
        answers: Vec<String>,
    },
    CreateNextRound {
        session_id: Uuid,
        #[serde(default)]
        count: Option<u32>,
    },
    AddMoreQuestions {
        session_id: Uuid,
        #[serde(default)]
        count: Option<u32>,
    },
    ProjectSuggestItems {
        session_id: Uuid,
        prompt: String,
    },
    ProjectBoardEdit {
        session_id: Uuid,
        instruction: String,
    },
}

impl TaskRequest {
    pub fn job_type(&self) -> JobType {
        match self {
            Self::CreateSession { .. } => JobType::CreateSession,
            Self::SubmitAnswers { .. } => JobType::SubmitAnswers,
            Self::CreateNextRound { .. } => JobType::CreateNextRound,
            Self::AddMoreQuestions { .. } => JobType::AddMoreQuestions,
            Self::ProjectSuggestItems { .. } => JobType::ProjectSuggestItems,
            Self::ProjectBoardEdit { .. } => JobType::ProjectBoardEdit,
        }
    }

    pub fn session_id(&self) -> Option<Uuid> {
        match self {
            Self::CreateSession { .. } => None,
            Self::SubmitAnswers { session_id, .. }
            | Self::CreateNextRound { session_id, .. }
            | Self::AddMoreQuestions { session_id, .. }
            | Self::ProjectSuggestItems { session_id, .. }
            | Self::ProjectBoardEdit { session_id, .. } => Some(*session_id),
        }
    }

    /// Bind the request to the session store it writes into.
    pub fn into_task(self, sessions: Arc<SessionStore>) -> Arc<dyn JobTask> {
        Arc::new(SessionTask {
            request: self,
            sessions,
        })
    }
}

/// A `TaskRequest` bound to its session store.
pub struct SessionTask {
    request: TaskRequest,
    sessions: Arc<SessionStore>,
}

impl SessionTask {
    async fn load_session(&self) -> Result<Session, JobError> {
        match self.request.session_id() {
            Some(id) => Ok(self.sessions.load(id).await?),
            None => Err(JobError::UpstreamFailure(
                "Task has no session to work on".to_string(),
            )),
        }
    }

    fn generation_prompt(&self, analysis: &str) -> (String, String) {
        match &self.request {
            TaskRequest::CreateSession { count, .. }
            | TaskRequest::CreateNextRound { count, .. }
            | TaskRequest::AddMoreQuestions { count, .. } => {
                let n = count.unwrap_or(DEFAULT_QUESTION_COUNT);
                let system = format!(
                    "You write study questions. Produce exactly {n} new questions \
                     based on the notes below, avoiding any question already asked.\n\n{QUESTION_RULES}"
                );
                (system, analysis.to_string())
            }
            TaskRequest::SubmitAnswers { .. } => (
                "You are a tutor. For each question/answer pair, say whether the answer \
                 is correct and briefly explain. Finish with one line of overall feedback."
                    .to_string(),
                analysis.to_string(),
            ),
            TaskRequest::ProjectSuggestItems { prompt, .. } => (
                "You help plan projects. Suggest concrete new board items, one per line."
                    .to_string(),
                format!("{analysis}\n\nRequest: {prompt}"),
            ),
            TaskRequest::ProjectBoardEdit { instruction, .. } => (
                "You edit project boards. Describe the edits to apply, one per line, \
                 as `<item>: <change>`."
                    .to_string(),
                format!("{analysis}\n\nInstruction: {instruction}"),
            ),
        }
    }
}

#[async_trait]
impl JobTask for SessionTask {
    fn job_type(&self) -> JobType {
        self.request.job_type()
    }

    fn session_id(&self) -> Option<Uuid> {
        self.request.session_id()
    }

    async fn extract(&self, ctx: &mut StepContext) -> Result<(), JobError> {
        let material = match &self.request {
            TaskRequest::CreateSession { source, .. } => {
                if source.trim().is_empty() {
                    return Err(JobError::UpstreamFailure(
                        "No source material provided".to_string(),
                    ));
                }
                source.clone()
            }
            _ => describe_session(&self.load_session().await?),
        };
        ctx.put(MATERIAL, truncate(&material, MAX_MATERIAL_CHARS));
        Ok(())
    }

    async fn analyze(&self, ctx: &mut StepContext) -> Result<(), JobError> {
        let material = ctx.require(MATERIAL)?.to_string();
        let analysis = match &self.request {
            TaskRequest::CreateSession { .. } => {
                let request = CompletionRequest::new(vec![
                    ChatMessage::system(
                        "Summarize the key facts and concepts in the material as terse notes.",
                    ),
                    ChatMessage::user(material),
                ])
                .with_temperature(0.2)
                .with_max_tokens(ANALYSIS_MAX_TOKENS);
                ctx.complete(request).await?
            }
            TaskRequest::SubmitAnswers { answers, .. } => {
                let session = self.load_session().await?;
                let round = session.current_round().ok_or_else(|| {
                    JobError::UpstreamFailure("Session has no round to answer".to_string())
                })?;
                round
                    .questions
                    .iter()
                    .enumerate()
                    .map(|(i, q)| {
                        let answer = answers.get(i).map(String::as_str).unwrap_or("(no answer)");
                        format!("Q: {q}\nA: {answer}")
                    })
                    .collect::<Vec<_>>()
                    .join("\n\n")
            }
            _ => material,
        };
        ctx.put(ANALYSIS, analysis);
        Ok(())
    }

    async fn generate(&self, ctx: &mut StepContext) -> Result<(), JobError> {
        let (system, user) = self.generation_prompt(ctx.require(ANALYSIS)?);
        let request = CompletionRequest::new(vec![ChatMessage::system(system), ChatMessage::user(user)])
            .with_temperature(0.7)
            .with_max_tokens(GENERATION_MAX_TOKENS);
        let output = ctx.complete(request).await?;
        if output.trim().is_empty() {
            return Err(JobError::UpstreamFailure(
                "Generation returned no content".to_string(),
            ));
        }
        ctx.put(OUTPUT, output);
        Ok(())
    }

    async fn finalize(&self, ctx: &mut StepContext) -> Result<Uuid, JobError> {
        let output = ctx.require(OUTPUT)?;

        let session = match &self.request {
            TaskRequest::CreateSession { title, source, .. } => {
                let mut session = Session::new(title.clone(), source.clone());
                session.summary = ctx.get(ANALYSIS).map(str::to_string);
                session.push_round(parse_lines(output)?);
                self.sessions.save(&mut session).await?;
                session
            }
            TaskRequest::SubmitAnswers { session_id, answers } => {
                self.sessions
                    .modify(*session_id, |session| {
                        let round = session.current_round_mut().ok_or_else(|| {
                            JobError::UpstreamFailure("Session has no round to answer".to_string())
                        })?;
                        round.answers = answers.clone();
                        round.feedback = Some(output.trim().to_string());
                        Ok::<_, JobError>(())
                    })
                    .await?
            }
            TaskRequest::CreateNextRound { session_id, .. } => {
                let questions = parse_lines(output)?;
                self.sessions
                    .modify(*session_id, |session| {
                        session.push_round(questions);
                        Ok::<_, JobError>(())
                    })
                    .await?
            }
            TaskRequest::AddMoreQuestions { session_id, .. } => {
                let questions = parse_lines(output)?;
                self.sessions
                    .modify(*session_id, |session| {
                        match session.current_round_mut() {
                            Some(round) => round.questions.extend(questions),
                            None => {
                                session.push_round(questions);
                            }
                        }
                        Ok::<_, JobError>(())
                    })
                    .await?
            }
            TaskRequest::ProjectSuggestItems { session_id, .. }
            | TaskRequest::ProjectBoardEdit { session_id, .. } => {
                self.sessions
                    .modify(*session_id, |session| {
                        session.notes.push(output.trim().to_string());
                        Ok::<_, JobError>(())
                    })
                    .await?
            }
        };

        Ok(session.id)
    }
}

/// Render a session as plain text for prompting.
fn describe_session(session: &Session) -> String {
    let mut out = format!("Topic: {}\n", session.title);
    if let Some(ref summary) = session.summary {
        out.push_str(&format!("Notes:\n{summary}\n"));
    } else {
        out.push_str(&format!("Material:\n{}\n", session.source));
    }
    for round in &session.rounds {
        out.push_str(&format!("\nRound {} questions:\n", round.number));
        for q in &round.questions {
            out.push_str(&format!("- {q}\n"));
        }
    }
    for note in &session.notes {
        out.push_str(&format!("\nNote:\n{note}\n"));
    }
    out
}

/// Split model output into clean non-empty lines, dropping list markers.
fn parse_lines(output: &str) -> Result<Vec<String>, JobError> {
    let lines: Vec<String> = output
        .lines()
        .map(|l| strip_list_marker(l.trim()).to_string())
        .filter(|l| !l.is_empty())
        .collect();
    if lines.is_empty() {
        return Err(JobError::UpstreamFailure(
            "Generation returned no usable lines".to_string(),
        ));
    }
    Ok(lines)
}

/// Remove a leading `1.`, `2)`, `-`, `*` or `•` marker. Text that merely
/// starts with a number is left alone.
fn strip_list_marker(line: &str) -> &str {
    let digits = line.len() - line.trim_start_matches(|c: char| c.is_ascii_digit()).len();
    if digits > 0 {
        if let Some(rest) = line[digits..].strip_prefix(['.', ')']) {
            return rest.trim_start();
        }
        return line;
    }
    match line.strip_prefix(['-', '*', '•']) {
        Some(rest) => rest.trim_start(),
        None => line,
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        // Find a safe char boundary
        let mut end = max;
        while end > 0 && !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}
