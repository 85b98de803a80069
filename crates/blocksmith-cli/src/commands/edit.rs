use crate::commands::read_input;
use crate::console::user_prompt;
use crate::output::{print_json, render_parse, render_round};
use crate::{ApplyArgs, ParseArgs};
use anyhow::Result;
use blocksmith_agent::{WorkspaceFiles, apply_response};
use blocksmith_edit::parse_edit_blocks;
use std::path::Path;

pub(crate) fn run_apply(cwd: &Path, args: ApplyArgs, json_mode: bool) -> Result<bool> {
    let response = read_input(&args.input)?;
    let mut files = WorkspaceFiles::new(cwd)?;
    for path in &args.edit {
        files.add_editable(path)?;
    }
    let prompt = user_prompt(args.yes, args.input == "-");
    let result = apply_response(&mut files, prompt.as_ref(), &response)?;
    if json_mode {
        print_json(&result)?;
    } else {
        print!("{}", render_round(&result));
    }
    Ok(result.is_clean())
}

pub(crate) fn run_parse(args: ParseArgs, json_mode: bool) -> Result<bool> {
    let outcome = parse_edit_blocks(&read_input(&args.input)?);
    if json_mode {
        print_json(&outcome)?;
    } else {
        print!("{}", render_parse(&outcome));
    }
    Ok(true)
}
