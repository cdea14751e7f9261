//! Structured multi-agent deliberation.
//!
//! The first participant poses a position, every other participant
//! critiques it in parallel, the poser revises, and the synthesizer writes
//! the conclusion. A lone participant critiques its own position. Each
//! phase lands in the report whether it completed, was skipped, or failed.

use agora_core::AgoraError;
use agora_tools::{
    CallOrigin, CrossAgentBackend, DeliberationPhase, DeliberationReport, DeliberationRequest,
    DeliberationStage, PhaseStatus,
};
use futures::future::join_all;
use tracing::{info, warn};

use crate::dispatcher::Dispatcher;

fn pose_prompt(topic: &str) -> String {
    format!(
        "You are opening a deliberation between agents.\n\nTopic: {topic}\n\n\
         State your position on the topic and the reasoning behind it. Be concrete."
    )
}

fn critique_prompt(topic: &str, position: &str) -> String {
    format!(
        "Critique the following position on \"{topic}\". Point out weaknesses, \
         missing considerations, and anything you disagree with.\n\nPosition:\n{position}"
    )
}

fn revise_prompt(topic: &str, feedback: &[(&str, &str)]) -> String {
    let mut out = format!(
        "Other agents reviewed your position on \"{topic}\". Revise your position in light of this feedback.\n"
    );
    for (agent, text) in feedback {
        out.push_str(&format!("\n[{agent}]\n{text}\n"));
    }
    out
}

fn synthesis_prompt(topic: &str, position: &str, feedback: &[(&str, &str)]) -> String {
    let mut out = format!(
        "Write the final synthesis of a deliberation on \"{topic}\". \
         Give a clear conclusion and note any open disagreement.\n\nFinal position:\n{position}\n"
    );
    if !feedback.is_empty() {
        out.push_str("\nFeedback received:\n");
        for (agent, text) in feedback {
            out.push_str(&format!("\n[{agent}]\n{text}\n"));
        }
    }
    out
}

fn phase(stage: DeliberationStage, agent: &str, result: &Result<String, AgoraError>, on_error: PhaseStatus) -> DeliberationPhase {
    match result {
        Ok(text) => DeliberationPhase {
            stage,
            agent: agent.to_string(),
            status: PhaseStatus::Completed,
            text: Some(text.clone()),
            error: None,
        },
        Err(e) => DeliberationPhase {
            stage,
            agent: agent.to_string(),
            status: on_error,
            text: None,
            error: Some(e.to_string()),
        },
    }
}

fn skipped(stage: DeliberationStage, agent: &str, reason: &str) -> DeliberationPhase {
    DeliberationPhase {
        stage,
        agent: agent.to_string(),
        status: PhaseStatus::Skipped,
        text: None,
        error: Some(reason.to_string()),
    }
}

async fn ask(dispatcher: &Dispatcher, origin: &CallOrigin, agent: &str, prompt: &str) -> Result<String, AgoraError> {
    dispatcher
        .ask(origin, agent, prompt, Some(dispatcher.ask_timeout()))
        .await
        .map(|reply| reply.text)
}

/// Run all four stages. Participants are validated by the caller.
pub(crate) async fn run(
    dispatcher: &Dispatcher,
    origin: &CallOrigin,
    request: DeliberationRequest,
) -> Result<DeliberationReport, AgoraError> {
    let DeliberationRequest {
        topic,
        agents,
        synthesizer,
    } = request;
    let Some(poser) = agents.first().cloned() else {
        return Err(AgoraError::Other(anyhow::anyhow!("deliberation needs at least one agent")));
    };
    let synthesizer = synthesizer.unwrap_or_else(|| poser.clone());
    let mut phases = Vec::new();
    info!(source = %origin.agent_id, %topic, participants = agents.len(), "[Deliberate] Starting");

    let posed = ask(dispatcher, origin, &poser, &pose_prompt(&topic)).await;
    phases.push(phase(DeliberationStage::Pose, &poser, &posed, PhaseStatus::Failed));
    let position = match posed {
        Ok(text) => text,
        Err(e) => {
            warn!(agent = %poser, error = %e, "[Deliberate] Pose failed, stopping");
            return Ok(DeliberationReport {
                topic,
                phases,
                conclusion: None,
            });
        }
    };

    let critics: Vec<&String> = if agents.len() > 1 {
        agents[1..].iter().collect()
    } else {
        vec![&poser]
    };
    let prompt = critique_prompt(&topic, &position);
    let critiques = join_all(critics.iter().map(|critic| ask(dispatcher, origin, critic, &prompt))).await;
    let mut feedback: Vec<(&str, &str)> = Vec::new();
    for (critic, result) in critics.iter().zip(&critiques) {
        phases.push(phase(DeliberationStage::Critique, critic, result, PhaseStatus::Skipped));
        match result {
            Ok(text) => feedback.push((critic.as_str(), text.as_str())),
            Err(e) => warn!(agent = %critic, error = %e, "[Deliberate] Critique skipped"),
        }
    }

    let position = if feedback.is_empty() {
        phases.push(skipped(DeliberationStage::Revise, &poser, "no critiques to revise against"));
        position
    } else {
        let revised = ask(dispatcher, origin, &poser, &revise_prompt(&topic, &feedback)).await;
        phases.push(phase(DeliberationStage::Revise, &poser, &revised, PhaseStatus::Failed));
        revised.unwrap_or(position)
    };

    let synthesis = ask(dispatcher, origin, &synthesizer, &synthesis_prompt(&topic, &position, &feedback)).await;
    phases.push(phase(DeliberationStage::Synthesize, &synthesizer, &synthesis, PhaseStatus::Failed));
    let conclusion = synthesis.ok();
    info!(
        %topic,
        phases = phases.len(),
        concluded = conclusion.is_some(),
        "[Deliberate] Finished"
    );
    Ok(DeliberationReport {
        topic,
        phases,
        conclusion,
    })
}
