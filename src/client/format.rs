//! Output formatting for CLI client commands.
//!
//! Human-readable tables and status lines on stdout. Per-platform
//! failures behind a partial answer go to stderr so that the table
//! itself stays pipeable.

use crate::engine::RaiseOutcome;
use crate::error::SendError;
use crate::model::{
    ApplicationInstance, BroadcastResult, HandlerTarget, IntentHandler, IntentList, Platform,
};

use super::broker_client::ResolveResult;

/// Print platform descriptors as a table to stdout.
pub fn print_platforms(platforms: &[Platform]) {
    if platforms.is_empty() {
        println!("No platforms registered");
        return;
    }

    println!("{:<24} {:<12} STATUS", "PLATFORM", "VERSION");
    println!("{}", "-".repeat(60));
    for p in platforms {
        println!("{:<24} {:<12} {}", p.name, p.version, p.connection_status);
    }
}

/// Print resolution candidates, one row per handler.
pub fn print_resolution(result: &ResolveResult) {
    for failure in &result.failures {
        eprintln!("warning: {failure}");
    }
    if result.intents.iter().all(IntentList::is_empty) {
        println!("No handlers found");
        return;
    }

    println!("{:<20} {:<8} {:<40} CONTEXT_TYPES", "INTENT", "KIND", "HANDLER");
    println!("{}", "-".repeat(90));
    for list in &result.intents {
        for handler in list.candidates() {
            println!("{}", handler_row(&list.intent, handler));
        }
    }
}

/// Print the outcome of a raise.
pub fn print_raise(outcome: &RaiseOutcome) {
    match outcome {
        RaiseOutcome::Resolved(result) => {
            println!("Handled by {}", result.instance);
            if let Some(data) = &result.data {
                match serde_json::to_string_pretty(data) {
                    Ok(json) => println!("{json}"),
                    Err(e) => eprintln!("warning: result not printable: {e}"),
                }
            }
        }
        RaiseOutcome::SelectionRequired(list) => {
            println!(
                "{} candidates for {}; raise again with --app to choose:",
                list.len(),
                list.intent
            );
            for handler in list.candidates() {
                println!("  {}", handler_row(&list.intent, handler));
            }
        }
    }
}

pub fn print_broadcast(result: &BroadcastResult) {
    println!("{}", broadcast_line(result));
}

pub fn print_open(instance: &ApplicationInstance) {
    println!("Opened {instance}");
}

pub fn print_instances(instances: &[ApplicationInstance]) {
    if instances.is_empty() {
        println!("No running instances");
        return;
    }
    for instance in instances {
        println!("{instance}");
    }
}

fn handler_row(intent: &str, handler: &IntentHandler) -> String {
    let (kind, target) = match &handler.target {
        HandlerTarget::Application { application } => ("app", application.to_string()),
        HandlerTarget::Instance { instance } => ("running", instance.to_string()),
    };
    format!("{intent:<20} {kind:<8} {target:<40} {}", handler.context_types)
}

fn broadcast_line(result: &BroadcastResult) -> String {
    match (&result.error, &result.error_msg) {
        (SendError::SendOk, None) => "Broadcast sent".to_string(),
        (SendError::SendOk, Some(msg)) => format!("Broadcast sent (partial: {msg})"),
        (code, Some(msg)) => format!("Broadcast failed: {code}: {msg}"),
        (code, None) => format!("Broadcast failed: {code}"),
    }
}
