use crate::commands::read_input;
use crate::{RunArgs, SummarizeArgs};
use crate::console::user_prompt;
use crate::output::print_json;
use anyhow::Result;
use blocksmith_agent::{SessionOrchestrator, WorkspaceFiles, summarize_oneline};
use blocksmith_core::{AppConfig, StreamCallback, StreamChunk};
use blocksmith_llm::HttpChatClient;
use serde_json::json;
use signal_hook::consts::SIGINT;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

pub(crate) fn run_session_cmd(
    cwd: &Path,
    args: RunArgs,
    json_mode: bool,
    verbose: bool,
) -> Result<bool> {
    let mut cfg = AppConfig::load(cwd)?;
    if let Some(model) = args.model {
        cfg.llm.model = model;
    }
    if let Some(max) = args.max_reflections {
        cfg.session.max_reflections = max;
    }
    cfg.session.auto_confirm |= args.yes;
    cfg.observe.verbose |= verbose;

    let mut files = WorkspaceFiles::new(cwd)?;
    for path in &args.edit {
        files.add_editable(path)?;
    }
    for path in &args.read {
        files.add_read_only(path)?;
    }

    let llm = Arc::new(HttpChatClient::new(cfg.llm.clone())?);
    let prompt = user_prompt(cfg.session.auto_confirm, false);
    let mut session = SessionOrchestrator::for_workspace(cfg, llm, files)?.with_user_prompt(prompt);

    // Ctrl-C cancels the in-flight round instead of killing the process.
    signal_hook::flag::register(SIGINT, session.cancellation().flag())?;

    if !json_mode {
        let cb: StreamCallback = Arc::new(|chunk| match chunk {
            StreamChunk::ContentDelta(text) => {
                print!("{text}");
                let _ = std::io::stdout().flush();
            }
            StreamChunk::Retrying { attempt, delay_ms } => {
                eprintln!("\n[blocksmith] retrying request (attempt {attempt}) in {delay_ms}ms");
            }
            StreamChunk::Done => println!(),
        });
        session.set_stream_callback(cb);
    }

    let report = session.run_session(&args.instruction.join(" "))?;
    if json_mode {
        print_json(&report)?;
    } else {
        println!("\n{}", report.render().trim_end());
    }
    Ok(report.is_success())
}

pub(crate) fn run_summarize(cwd: &Path, args: SummarizeArgs, json_mode: bool) -> Result<bool> {
    let changes = read_input(&args.input)?;
    let mut cfg = AppConfig::load(cwd)?;
    if let Some(model) = args.model {
        cfg.llm.model = model;
    }
    let llm = HttpChatClient::new(cfg.llm.clone())?;
    let summary = summarize_oneline(&llm, &cfg.llm, &changes)?;
    if json_mode {
        print_json(&json!({"summary": summary}))?;
    } else {
        println!("{summary}");
    }
    Ok(true)
}
