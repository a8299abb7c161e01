//! Phase one of an iteration: ask the agent which task to do next.
//!
//! The selection call is tool-free and read-only. Anything that goes wrong
//! here degrades to single-phase legacy mode instead of halting the run.

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use crate::core::reply::{self, Selection};
use crate::core::tasklist::TaskList;
use crate::intervene::InterventionChannel;
use crate::io::agent::{Agent, AgentRequest, AgentRun};
use crate::io::prompt::{PromptBuilder, PromptInputs};

/// Result of the selection phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectOutcome {
    /// The agent declared every remaining task satisfied.
    Complete,
    /// A concrete task to implement this iteration.
    Picked { id: String, description: String },
    /// Selection produced nothing usable; fall back to legacy mode.
    Fallback { reason: String },
    /// A human interrupted the call.
    Interrupted,
}

/// Run the selection call and resolve its answer against the list.
#[instrument(skip_all)]
pub fn select_task<A: Agent>(
    agent: &A,
    channel: &InterventionChannel,
    builder: &PromptBuilder,
    inputs: &PromptInputs,
    list: &TaskList,
    mut request: AgentRequest,
) -> Result<SelectOutcome> {
    request.prompt = builder.build_selection(inputs);
    request.allow_tools = false;

    let run = agent.invoke(&request, channel)?;
    let transcript = match run {
        AgentRun::Completed(t) => t,
        AgentRun::Interrupted => return Ok(SelectOutcome::Interrupted),
    };
    if !transcript.ok {
        warn!("selection call reported failure, falling back");
        return Ok(SelectOutcome::Fallback {
            reason: "selection call failed".to_string(),
        });
    }
    if reply::contains_run_complete(&transcript.text) {
        info!("agent declared all tasks complete");
        return Ok(SelectOutcome::Complete);
    }

    Ok(resolve_selection(list, reply::parse_selection(&transcript.text)))
}

/// Map a parsed selection onto an actual incomplete task.
pub fn resolve_selection(list: &TaskList, selection: Option<Selection>) -> SelectOutcome {
    let Some(selection) = selection else {
        return SelectOutcome::Fallback {
            reason: "no structured selection in reply".to_string(),
        };
    };
    match selection {
        Selection::Id(id) => match list.find_by_id(&id) {
            Some(item) if item.is_done() => SelectOutcome::Fallback {
                reason: format!("selected task {id} is already done"),
            },
            Some(item) => {
                debug!(id = %item.id, "resolved selection by id");
                SelectOutcome::Picked {
                    id: item.id.clone(),
                    description: item.description.clone(),
                }
            }
            None => SelectOutcome::Fallback {
                reason: format!("selected task id {id} not in list"),
            },
        },
        Selection::Description(text) => match list.find_by_description(&text) {
            Some(item) if item.is_done() => SelectOutcome::Fallback {
                reason: format!("selected task '{text}' is already done"),
            },
            Some(item) => {
                debug!(id = %item.id, "resolved selection by description");
                SelectOutcome::Picked {
                    id: item.id.clone(),
                    description: item.description.clone(),
                }
            }
            None => SelectOutcome::Fallback {
                reason: format!("selected task '{text}' not in list"),
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tasklist::Priority;
    use crate::io::agent::DEFAULT_AGENT_TIMEOUT;
    use crate::test_support::{ScriptedAgent, ScriptedRun, list, task};

    fn request() -> AgentRequest {
        AgentRequest {
            workdir: std::env::temp_dir(),
            prompt: String::new(),
            allow_tools: true,
            max_turns: 5,
            timeout: DEFAULT_AGENT_TIMEOUT,
            events_path: None,
        }
    }

    fn sample_list() -> TaskList {
        list(vec![
            task("1", "Add login form", Priority::High),
            task("2", "Write docs", Priority::Low),
        ])
    }

    #[test]
    fn strict_id_reply_resolves_to_task() {
        let agent = ScriptedAgent::new(vec![ScriptedRun::Reply(
            "SELECTED_TASK_ID: 2\nit is self-contained".to_string(),
        )]);
        let channel = InterventionChannel::new();
        let outcome = select_task(
            &agent,
            &channel,
            &PromptBuilder::new(100_000),
            &PromptInputs::default(),
            &sample_list(),
            request(),
        )
        .expect("select");
        assert_eq!(
            outcome,
            SelectOutcome::Picked {
                id: "2".to_string(),
                description: "Write docs".to_string(),
            }
        );
        // Selection prompts must run tool-free.
        assert!(agent.prompts()[0].contains("Do not modify any files"));
    }

    #[test]
    fn sentinel_reply_completes_the_run() {
        let agent = ScriptedAgent::new(vec![ScriptedRun::Reply("ALL_TASKS_COMPLETE".to_string())]);
        let channel = InterventionChannel::new();
        let outcome = select_task(
            &agent,
            &channel,
            &PromptBuilder::new(100_000),
            &PromptInputs::default(),
            &sample_list(),
            request(),
        )
        .expect("select");
        assert_eq!(outcome, SelectOutcome::Complete);
    }

    #[test]
    fn unusable_reply_falls_back() {
        let agent = ScriptedAgent::new(vec![ScriptedRun::Reply(
            "I would start somewhere reasonable".to_string(),
        )]);
        let channel = InterventionChannel::new();
        let outcome = select_task(
            &agent,
            &channel,
            &PromptBuilder::new(100_000),
            &PromptInputs::default(),
            &sample_list(),
            request(),
        )
        .expect("select");
        assert!(matches!(outcome, SelectOutcome::Fallback { .. }));
    }

    #[test]
    fn unknown_id_falls_back() {
        let outcome = resolve_selection(&sample_list(), Some(Selection::Id("9".to_string())));
        assert!(matches!(outcome, SelectOutcome::Fallback { .. }));
    }

    #[test]
    fn done_task_selection_falls_back() {
        let mut list = sample_list();
        list.mark_item_complete("1");
        let outcome = resolve_selection(&list, Some(Selection::Id("1".to_string())));
        assert!(matches!(outcome, SelectOutcome::Fallback { .. }));
    }

    #[test]
    fn description_selection_uses_fuzzy_match() {
        let outcome = resolve_selection(
            &sample_list(),
            Some(Selection::Description("login".to_string())),
        );
        assert_eq!(
            outcome,
            SelectOutcome::Picked {
                id: "1".to_string(),
                description: "Add login form".to_string(),
            }
        );
    }
}
