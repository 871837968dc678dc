//! The query pipeline as an explicit state machine.
//!
//! ```text
//! Classify -> Authorize -> GenerateSql -> ValidateSql -> ApplyFilter -> Execute
//!          -> GenerateAnswer -> ValidateAnswer -> Record -> Done
//! ```
//!
//! `ValidateSql`, `ApplyFilter` and `Execute` may step to `Retry`, which loops back
//! to `GenerateSql` with the failure reason until `max_retries` is spent. Oracle
//! failures are terminal and never retried.

use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::memory::ConversationTurn;
use super::security::{Classification, SecurityValidator};
use super::session::Session;
use super::sql_scan;
use super::state::{Outcome, QueryResponse, QueryState};
use super::validation::AnswerValidator;
use crate::config::AgentConfig;
use crate::db::executor::QueryExecutor;
use crate::llm::models::{AnswerGenerationInput, SqlGenerationInput};
use crate::llm::{AnswerGenerator, LlmError, SqlGenerator};

pub const CONVERSATIONAL_RESPONSE: &str = "I'm a property management assistant specialized in analyzing your real estate data.

I can help you with:
- Property counts and statistics
- Rent analysis and averages
- Profitability calculations
- Unit details and occupancy

Try asking:
- \"How many properties do I have?\"
- \"What is my most profitable property?\"
- \"What's the average rent I received?\"

What would you like to know about your properties?";

#[derive(Debug, Clone, PartialEq)]
enum Stage {
    Classify,
    Authorize,
    GenerateSql,
    ValidateSql,
    ApplyFilter,
    Execute,
    GenerateAnswer,
    ValidateAnswer,
    Record(Outcome),
    Retry(String),
    Done(Outcome),
}

pub struct QueryOrchestrator {
    sql_generator: Arc<dyn SqlGenerator>,
    answer_generator: Arc<dyn AnswerGenerator>,
    executor: Arc<dyn QueryExecutor>,
    schema_context: String,
    validator: AnswerValidator,
    max_retries: u32,
    debug_mode: bool,
}

impl QueryOrchestrator {
    pub fn new(
        sql_generator: Arc<dyn SqlGenerator>,
        answer_generator: Arc<dyn AnswerGenerator>,
        executor: Arc<dyn QueryExecutor>,
        schema_context: String,
        config: &AgentConfig,
    ) -> Self {
        Self {
            sql_generator,
            answer_generator,
            executor,
            schema_context,
            validator: AnswerValidator::new(
                config.answer_tolerance,
                config.valid_threshold,
                config.low_confidence_threshold,
            ),
            max_retries: config.max_retries.max(1),
            debug_mode: config.debug_mode,
        }
    }

    /// Runs one question through the pipeline for `session`.
    pub async fn process(&self, session: &mut Session, query: &str) -> QueryResponse {
        session.touch();
        let rewritten = session.memory.enhance(query);
        let mut state = QueryState::new(query, rewritten);
        info!(
            "Processing query for {} (session {}): {}",
            session.user.display_name(),
            session.id,
            query
        );

        let mut stage = Stage::Classify;
        let outcome = loop {
            debug!("Stage: {:?}", stage);
            stage = match stage {
                Stage::Done(outcome) => break outcome,
                other => self.step(other, &mut state, session).await,
            };
        };

        info!(
            "Query finished with {:?} after {} retries and {} oracle calls",
            outcome, state.retry_count, state.oracle_calls
        );
        let answer = state.final_answer.take().unwrap_or_default();
        QueryResponse::from_state(state, outcome, answer)
    }

    async fn step(&self, stage: Stage, state: &mut QueryState, session: &mut Session) -> Stage {
        match stage {
            Stage::Classify => {
                let classification = if state.raw_query.trim().is_empty() {
                    Classification::Conversational
                } else {
                    SecurityValidator::classify(&state.raw_query)
                };
                state.classification = Some(classification);
                match classification {
                    Classification::Conversational => {
                        state.final_answer = Some(CONVERSATIONAL_RESPONSE.to_string());
                        Stage::Done(Outcome::Conversational)
                    }
                    Classification::Data => Stage::Authorize,
                }
            }

            Stage::Authorize => {
                let authorization = SecurityValidator::authorize(&state.rewritten_query, &session.user);
                let allowed = authorization.allowed;
                if !allowed {
                    info!(
                        "Access denied for {}: {}",
                        session.user.display_name(),
                        authorization.reason.as_deref().unwrap_or("no reason given")
                    );
                    state.final_answer = authorization.reason.clone();
                }
                state.authorization = Some(authorization);
                if allowed {
                    Stage::GenerateSql
                } else {
                    Stage::Done(Outcome::AccessDenied)
                }
            }

            Stage::GenerateSql => {
                let input = SqlGenerationInput {
                    question: state.rewritten_query.clone(),
                    schema: self.schema_context.clone(),
                    prior_error: if state.retry_count > 0 {
                        state.last_error().map(str::to_string)
                    } else {
                        None
                    },
                };
                state.oracle_calls += 1;
                match self.sql_generator.generate_sql(&input).await {
                    Ok(sql) => {
                        debug!("Generated SQL: {}", sql);
                        state.generated_sql = Some(sql);
                        state.validated_sql = None;
                        Stage::ValidateSql
                    }
                    Err(e) => self.oracle_unavailable(state, e),
                }
            }

            Stage::ValidateSql => {
                let sql = state.generated_sql.clone().unwrap_or_default();
                if let Err(reason) = SecurityValidator::validate_sql(&sql)
                    .and_then(|_| SecurityValidator::validate_projection(&sql, &session.user))
                {
                    return Stage::Retry(reason);
                }

                let normalized = sql_scan::normalize(&sql);
                let head = normalized.trim_start().to_ascii_lowercase();
                if !(head.starts_with("select") || head.starts_with("with") || head.starts_with('(')) {
                    return Stage::Retry("Only SELECT queries are allowed".to_string());
                }
                state.validated_sql = Some(normalized);
                Stage::ApplyFilter
            }

            Stage::ApplyFilter => {
                let sql = state.validated_sql.clone().unwrap_or_default();
                match SecurityValidator::scope_for(&sql, &session.user) {
                    Ok(scoped) => {
                        state.validated_sql = Some(scoped);
                        Stage::Execute
                    }
                    Err(e) => Stage::Retry(e.to_string()),
                }
            }

            Stage::Execute => {
                let sql = state.validated_sql.clone().unwrap_or_default();
                match self.executor.execute(&sql).await {
                    Ok(result) => {
                        state.execution_result = Some(result);
                        Stage::GenerateAnswer
                    }
                    Err(e) => Stage::Retry(SecurityValidator::sanitize_error(&e.to_string())),
                }
            }

            Stage::GenerateAnswer => {
                let result_summary = state
                    .execution_result
                    .as_ref()
                    .map(|r| r.summarize())
                    .unwrap_or_else(|| "No results found.".to_string());
                let context = session.memory.context_prompt();
                let input = AnswerGenerationInput {
                    question: state.rewritten_query.clone(),
                    sql: state.validated_sql.clone().unwrap_or_default(),
                    result_summary,
                    context: (!context.is_empty()).then_some(context),
                };
                state.oracle_calls += 1;
                match self.answer_generator.generate_answer(&input).await {
                    Ok(answer) => {
                        state.final_answer = Some(answer);
                        Stage::ValidateAnswer
                    }
                    Err(e) => {
                        let done = self.oracle_unavailable(state, e);
                        self.record(state, session);
                        done
                    }
                }
            }

            Stage::ValidateAnswer => {
                let answer = state.final_answer.clone().unwrap_or_default();
                let Some(result) = state.execution_result.as_ref() else {
                    return Stage::Record(Outcome::Answered);
                };
                let report = self.validator.validate(result, &answer);
                let annotated = self.validator.annotate(&answer, &report, result);

                let outcome = match &report.warning {
                    Some(warning) => {
                        warn!("Answer validation warning (confidence {:.2}): {}", report.confidence, warning);
                        Outcome::AnsweredLowConfidence
                    }
                    None => Outcome::Answered,
                };
                state.confidence = report.confidence;
                state.warning = report.warning;
                state.final_answer = Some(annotated);
                Stage::Record(outcome)
            }

            Stage::Record(outcome) => {
                self.record(state, session);
                Stage::Done(outcome)
            }

            Stage::Retry(reason) => {
                state.retry_count += 1;
                warn!(
                    "Attempt {}/{} failed: {}",
                    state.retry_count, self.max_retries, reason
                );
                state.error_log.push(reason);

                if state.retry_count < self.max_retries {
                    Stage::GenerateSql
                } else {
                    error!("Giving up after {} attempts", state.retry_count);
                    state.final_answer = Some(format!(
                        "I wasn't able to answer that question after {} attempts. Please try rephrasing it.",
                        state.retry_count
                    ));
                    if self.debug_mode {
                        state.technical_details = Some(state.error_log.join("\n"));
                    }
                    Stage::Done(Outcome::FailedAfterRetries)
                }
            }

            Stage::Done(outcome) => Stage::Done(outcome),
        }
    }

    fn oracle_unavailable(&self, state: &mut QueryState, e: LlmError) -> Stage {
        error!("Language model unavailable: {}", e);
        state.error_log.push(e.class().to_string());
        state.final_answer = Some(e.friendly_message().to_string());
        state.confidence = 0.0;
        if self.debug_mode {
            state.technical_details = Some(e.to_string());
        }
        Stage::Done(Outcome::OracleUnavailable)
    }

    fn record(&self, state: &QueryState, session: &mut Session) {
        if state.execution_result.is_none() {
            return;
        }
        session.memory.record(ConversationTurn::new(
            &state.raw_query,
            state.validated_sql.clone(),
            state.execution_result.clone(),
            state.final_answer.as_deref().unwrap_or_default(),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::state::{Role, UserContext};
    use crate::db::executor::{DataError, QueryResult, ScalarValue};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays scripted completions; the last one repeats once the script runs out.
    struct ScriptedSql {
        script: Mutex<VecDeque<Result<String, LlmError>>>,
        fallback: String,
        inputs: Mutex<Vec<SqlGenerationInput>>,
    }

    impl ScriptedSql {
        fn new(script: Vec<Result<String, LlmError>>, fallback: &str) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                fallback: fallback.to_string(),
                inputs: Mutex::new(Vec::new()),
            })
        }

        fn always(sql: &str) -> Arc<Self> {
            Self::new(Vec::new(), sql)
        }

        fn calls(&self) -> usize {
            self.inputs.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl SqlGenerator for ScriptedSql {
        async fn generate_sql(&self, input: &SqlGenerationInput) -> Result<String, LlmError> {
            self.inputs.lock().unwrap().push(input.clone());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(self.fallback.clone()))
        }
    }

    struct FixedAnswer {
        answer: Option<String>,
        calls: Mutex<usize>,
    }

    impl FixedAnswer {
        fn new(answer: &str) -> Arc<Self> {
            Arc::new(Self { answer: Some(answer.to_string()), calls: Mutex::new(0) })
        }

        fn unreachable() -> Arc<Self> {
            Arc::new(Self { answer: None, calls: Mutex::new(0) })
        }
    }

    #[async_trait]
    impl AnswerGenerator for FixedAnswer {
        async fn generate_answer(&self, _input: &AnswerGenerationInput) -> Result<String, LlmError> {
            *self.calls.lock().unwrap() += 1;
            self.answer
                .clone()
                .ok_or_else(|| LlmError::ConnectionError("connection refused".to_string()))
        }
    }

    struct ScriptedExecutor {
        script: Mutex<VecDeque<Result<QueryResult, DataError>>>,
        executed: Mutex<Vec<String>>,
    }

    impl ScriptedExecutor {
        fn new(script: Vec<Result<QueryResult, DataError>>) -> Arc<Self> {
            Arc::new(Self { script: Mutex::new(script.into()), executed: Mutex::new(Vec::new()) })
        }

        fn executed(&self) -> Vec<String> {
            self.executed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl QueryExecutor for ScriptedExecutor {
        async fn execute(&self, sql: &str) -> Result<QueryResult, DataError> {
            self.executed.lock().unwrap().push(sql.to_string());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(QueryResult::default()))
        }
    }

    fn count(n: i64) -> QueryResult {
        QueryResult::new(vec!["count".into()], vec![vec![ScalarValue::Integer(n)]])
    }

    fn orchestrator(
        sql: Arc<ScriptedSql>,
        answer: Arc<FixedAnswer>,
        executor: Arc<ScriptedExecutor>,
        config: AgentConfig,
    ) -> QueryOrchestrator {
        QueryOrchestrator::new(sql, answer, executor, "Properties(property_id, owner_id)".to_string(), &config)
    }

    fn session(role: Role, owner_id: Option<i64>) -> Session {
        Session::new(UserContext::new(role, owner_id).unwrap(), 10)
    }

    #[tokio::test]
    async fn owner_count_is_scoped_to_owner() {
        let sql = ScriptedSql::always("SELECT COUNT(*) FROM Properties;");
        let answer = FixedAnswer::new("You have 12 properties.");
        let executor = ScriptedExecutor::new(vec![Ok(count(12))]);
        let agent = orchestrator(sql.clone(), answer, executor.clone(), AgentConfig::default());
        let mut session = session(Role::Owner, Some(2));

        let response = agent.process(&mut session, "How many properties do I have?").await;

        assert_eq!(response.outcome, Outcome::Answered);
        assert!(response.success);
        assert_eq!(response.answer, "You have 12 properties.");
        assert_eq!(response.confidence, 1.0);
        assert_eq!(response.retry_count, 0);
        assert!(response.error_log.is_empty());

        let executed = executor.executed();
        assert_eq!(executed.len(), 1);
        assert!(executed[0].contains("owner_id = 2"));
        assert!(!executed[0].contains(';'));
        assert_eq!(response.sql.as_deref(), Some(executed[0].as_str()));
        assert_eq!(session.memory.len(), 1);
    }

    #[tokio::test]
    async fn other_owner_reference_is_denied_without_oracle_calls() {
        let sql = ScriptedSql::always("SELECT COUNT(*) FROM Properties");
        let answer = FixedAnswer::new("unused");
        let executor = ScriptedExecutor::new(Vec::new());
        let agent = orchestrator(sql.clone(), answer.clone(), executor.clone(), AgentConfig::default());
        let mut session = session(Role::Owner, Some(2));

        let response = agent.process(&mut session, "How many properties does LLC3 have?").await;

        assert_eq!(response.outcome, Outcome::AccessDenied);
        assert!(!response.success);
        assert!(response.answer.contains("Access denied"));
        assert_eq!(sql.calls(), 0);
        assert_eq!(*answer.calls.lock().unwrap(), 0);
        assert!(executor.executed().is_empty());
        assert!(session.memory.is_empty());
    }

    #[tokio::test]
    async fn destructive_sql_exhausts_retries_without_executing() {
        let sql = ScriptedSql::always("DROP TABLE Properties");
        let executor = ScriptedExecutor::new(Vec::new());
        let agent = orchestrator(sql.clone(), FixedAnswer::new("unused"), executor.clone(), AgentConfig::default());
        let mut session = session(Role::Admin, None);

        let response = agent.process(&mut session, "Remove the properties table").await;

        assert_eq!(response.outcome, Outcome::FailedAfterRetries);
        assert!(!response.success);
        assert_eq!(response.retry_count, 3);
        assert_eq!(response.error_log.len(), 3);
        assert!(response.error_log.iter().all(|e| e.contains("DROP")));
        assert!(executor.executed().is_empty());
        assert!(response.technical_details.is_none());

        let inputs = sql.inputs.lock().unwrap();
        assert_eq!(inputs.len(), 3);
        assert_eq!(inputs[0].prior_error, None);
        assert!(inputs[1].prior_error.as_deref().unwrap().contains("DROP"));
    }

    #[tokio::test]
    async fn hallucinated_number_is_flagged() {
        let executor = ScriptedExecutor::new(vec![Ok(count(12))]);
        let agent = orchestrator(
            ScriptedSql::always("SELECT COUNT(*) FROM Properties"),
            FixedAnswer::new("You have 15 properties."),
            executor,
            AgentConfig::default(),
        );
        let mut session = session(Role::Admin, None);

        let response = agent.process(&mut session, "How many properties are there?").await;

        assert_eq!(response.outcome, Outcome::AnsweredLowConfidence);
        assert!(response.success);
        assert_eq!(response.confidence, 0.0);
        let warning = response.warning.unwrap();
        assert!(warning.contains("15") && warning.contains("12"));
        assert!(response.answer.starts_with("You have 15 properties."));
        assert!(response.answer.contains("LOW"));
        assert_eq!(session.memory.len(), 1);
    }

    #[tokio::test]
    async fn greeting_skips_the_pipeline() {
        let sql = ScriptedSql::always("SELECT 1");
        let executor = ScriptedExecutor::new(Vec::new());
        let agent = orchestrator(sql.clone(), FixedAnswer::new("unused"), executor.clone(), AgentConfig::default());
        let mut session = session(Role::Viewer, None);

        let response = agent.process(&mut session, "Hello there!").await;

        assert_eq!(response.outcome, Outcome::Conversational);
        assert!(response.success);
        assert_eq!(response.answer, CONVERSATIONAL_RESPONSE);
        assert_eq!(sql.calls(), 0);
        assert!(executor.executed().is_empty());
        assert!(session.memory.is_empty());
    }

    #[tokio::test]
    async fn oracle_failure_is_not_retried() {
        let sql = ScriptedSql::new(
            vec![Err(LlmError::QuotaExceeded("429 Too Many Requests".to_string()))],
            "SELECT 1",
        );
        let config = AgentConfig { debug_mode: true, ..AgentConfig::default() };
        let agent = orchestrator(sql.clone(), FixedAnswer::new("unused"), ScriptedExecutor::new(Vec::new()), config);
        let mut session = session(Role::Admin, None);

        let response = agent.process(&mut session, "How many properties are there?").await;

        assert_eq!(response.outcome, Outcome::OracleUnavailable);
        assert!(!response.success);
        assert_eq!(response.retry_count, 0);
        assert_eq!(sql.calls(), 1);
        assert_eq!(response.error_log, vec!["API_QUOTA".to_string()]);
        assert!(response.answer.contains("usage limit"));
        assert!(response.technical_details.unwrap().contains("429"));
    }

    #[tokio::test]
    async fn answer_oracle_failure_still_records_turn() {
        let agent = orchestrator(
            ScriptedSql::always("SELECT COUNT(*) FROM Units"),
            FixedAnswer::unreachable(),
            ScriptedExecutor::new(vec![Ok(count(166))]),
            AgentConfig::default(),
        );
        let mut session = session(Role::Admin, None);

        let response = agent.process(&mut session, "How many units are there?").await;

        assert_eq!(response.outcome, Outcome::OracleUnavailable);
        assert_eq!(response.error_log, vec!["NETWORK".to_string()]);
        assert!(response.technical_details.is_none());
        assert_eq!(session.memory.len(), 1);
    }

    #[tokio::test]
    async fn execution_error_feeds_the_next_attempt() {
        let sql = ScriptedSql::new(
            vec![Ok("SELECT AVG(rent) FROM Units".to_string())],
            "SELECT AVG(monthly_rent) FROM Units",
        );
        let executor = ScriptedExecutor::new(vec![
            Err(DataError::QueryError(
                "Binder Error: Referenced column \"rent\" not found in /var/data/pm.duckdb".to_string(),
            )),
            Ok(QueryResult::new(vec!["avg".into()], vec![vec![ScalarValue::Real(917.64)]])),
        ]);
        let agent = orchestrator(
            sql.clone(),
            FixedAnswer::new("The average rent is $917.64."),
            executor.clone(),
            AgentConfig::default(),
        );
        let mut session = session(Role::Admin, None);

        let response = agent.process(&mut session, "What is the average rent?").await;

        assert_eq!(response.outcome, Outcome::Answered);
        assert_eq!(response.retry_count, 1);
        assert!(response.error_log[0].contains("not found"));
        assert!(!response.error_log[0].contains("/var/data"));
        assert_eq!(executor.executed().len(), 2);
        let inputs = sql.inputs.lock().unwrap();
        assert!(inputs[1].prior_error.as_deref().unwrap().contains("rent"));
    }

    #[tokio::test]
    async fn unfilterable_owner_sql_is_retried() {
        let sql = ScriptedSql::new(
            vec![Ok("SELECT 42".to_string())],
            "SELECT COUNT(*) FROM Properties p",
        );
        let executor = ScriptedExecutor::new(vec![Ok(count(22))]);
        let agent = orchestrator(sql, FixedAnswer::new("You have 22 properties."), executor.clone(), AgentConfig::default());
        let mut session = session(Role::Owner, Some(1));

        let response = agent.process(&mut session, "How many properties do I have?").await;

        assert_eq!(response.outcome, Outcome::Answered);
        assert_eq!(response.retry_count, 1);
        assert!(response.error_log[0].contains("Row filter"));
        assert_eq!(executor.executed(), vec!["SELECT COUNT(*) FROM Properties p WHERE p.owner_id = 1".to_string()]);
    }

    #[tokio::test]
    async fn viewer_projection_is_retried() {
        let sql = ScriptedSql::new(
            vec![Ok("SELECT address, monthly_rent FROM Units JOIN Properties USING (property_id)".to_string())],
            "SELECT AVG(monthly_rent) FROM Units",
        );
        let executor = ScriptedExecutor::new(vec![Ok(QueryResult::new(
            vec!["avg".into()],
            vec![vec![ScalarValue::Real(917.64)]],
        ))]);
        let agent = orchestrator(sql, FixedAnswer::new("The average rent is $917.64."), executor.clone(), AgentConfig::default());
        let mut session = session(Role::Viewer, None);

        let response = agent.process(&mut session, "What is the average rent?").await;

        assert_eq!(response.outcome, Outcome::Answered);
        assert_eq!(response.retry_count, 1);
        assert!(response.error_log[0].contains("address"));
        assert_eq!(executor.executed(), vec!["SELECT AVG(monthly_rent) FROM Units".to_string()]);
    }

    #[tokio::test]
    async fn follow_up_reaches_generator_with_context() {
        let sql = ScriptedSql::always("SELECT COUNT(*) FROM Properties");
        let executor = ScriptedExecutor::new(vec![Ok(count(12)), Ok(count(3))]);
        let agent = orchestrator(sql.clone(), FixedAnswer::new("Done."), executor, AgentConfig::default());
        let mut session = session(Role::Admin, None);

        agent.process(&mut session, "How many properties does LLC2 have?").await;
        let response = agent.process(&mut session, "What about Arizona?").await;

        assert_eq!(response.outcome, Outcome::Answered);
        let inputs = sql.inputs.lock().unwrap();
        assert!(inputs[1].question.starts_with("What about Arizona?"));
        assert!(inputs[1].question.contains("owner LLC2"));
        assert_eq!(session.memory.len(), 2);
    }

    #[tokio::test]
    async fn max_retries_is_configurable() {
        let sql = ScriptedSql::always("SELECT 1; DELETE FROM Owners");
        let config = AgentConfig { max_retries: 1, ..AgentConfig::default() };
        let agent = orchestrator(sql.clone(), FixedAnswer::new("unused"), ScriptedExecutor::new(Vec::new()), config);
        let mut session = session(Role::Admin, None);

        let response = agent.process(&mut session, "Clean up owners").await;

        assert_eq!(response.outcome, Outcome::FailedAfterRetries);
        assert_eq!(response.retry_count, 1);
        assert_eq!(sql.calls(), 1);
    }
}
