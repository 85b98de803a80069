pub(crate) mod admin;
pub(crate) mod edit;
pub(crate) mod session;

use anyhow::Result;
use std::fs;
use std::io::Read;

/// Read a response from a file path, or from stdin when `input` is `-`.
pub(crate) fn read_input(input: &str) -> Result<String> {
    if input == "-" {
        let mut text = String::new();
        std::io::stdin().read_to_string(&mut text)?;
        return Ok(text);
    }
    Ok(fs::read_to_string(input)?)
}
