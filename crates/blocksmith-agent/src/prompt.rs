//! Prompt assembly for edit sessions.
//!
//! The default layout is: system intro with a workspace summary, two worked
//! example exchanges, read-only file contents, committed history, the
//! SEARCH/REPLACE rules, then the editable file contents last so they sit
//! closest to the new request.

use crate::workspace::FileOracle;
use anyhow::Result;
use blocksmith_core::ChatMessage;

/// Builds the messages that precede a session's own turns.
pub trait PromptBuilder {
    fn collect_messages(
        &self,
        files: &dyn FileOracle,
        history: &[ChatMessage],
    ) -> Result<Vec<ChatMessage>>;

    /// Text of the first user turn for `instruction`.
    fn wrap_instruction(&self, instruction: &str) -> String {
        format!("<instructions>\n{instruction}\n</instructions>")
    }
}

pub const SYSTEM_INTRO: &str = r#"Act as an expert software developer who edits code through SEARCH/REPLACE blocks.
Follow the conventions, libraries and style already present in the code base.
Implement every change completely; never leave a comment describing code instead of writing it.

Take requests for changes to the supplied code. If a request is ambiguous, ask questions.

Once the request is clear:

1. Decide whether you need to change code you cannot see.
   You may create new files without asking.
   To change an existing file whose content you have not been shown, name the file,
   ask the user to add it to the workspace, and stop.
2. Explain the needed changes in a few short sentences.
3. Describe each change with a *SEARCH/REPLACE* block, as in the examples below.

Every change to a file must use the *SEARCH/REPLACE* block format.
"#;

pub const RULES_REMINDER: &str = r#"<rules>
# *SEARCH/REPLACE block* rules

Every *SEARCH/REPLACE* block has this shape:
1. The opening fence: ```
2. The full file path alone on its line, verbatim. No backticks, asterisks, quotes or escaping.
3. The search marker: <<<<<<< SEARCH
4. A contiguous run of lines copied from the existing file
5. The divider: =======
6. The lines that replace them
7. The replace marker: >>>>>>> REPLACE
8. The closing fence: ```

The search lines must match the current file content character for character,
including comments, docstrings and indentation.

Only the first occurrence of the search lines is replaced. Use several blocks when
several places change, and include enough lines for each block to match uniquely.

Keep blocks short: the changing lines plus a little surrounding context.

To move code, use two blocks: one deleting it from the old place, one inserting it at the new place.

To create a file, use a block with the new path, an empty SEARCH section and the
whole file content in the REPLACE section.

If the user answers with something like "ok" or "go ahead", reply with the blocks
for the changes you proposed.

Use plain ASCII quotes; never smart quotes, not even in comments.

Only ever return code inside *SEARCH/REPLACE* blocks.
</rules>
"#;

pub const RULES_ACK: &str = "I will format my edits accordingly.";

const EXAMPLE_EDIT_REQUEST: &str = "Change get_factorial() to use math.factorial";

const EXAMPLE_EDIT_REPLY: &str = r#"To make this change `mathweb/flask/app.py` needs to:

1. Import the math package.
2. Drop the hand-written factorial() function.
3. Call math.factorial from get_factorial().

Here are the *SEARCH/REPLACE* blocks:

```
mathweb/flask/app.py
<<<<<<< SEARCH
from flask import Flask
=======
import math
from flask import Flask
>>>>>>> REPLACE
```

```
mathweb/flask/app.py
<<<<<<< SEARCH
def factorial(n):
    "compute factorial"
    if n == 0:
        return 1
    else:
        return n * factorial(n-1)
=======
>>>>>>> REPLACE
```

```
mathweb/flask/app.py
<<<<<<< SEARCH
    return str(factorial(n))
=======
    return str(math.factorial(n))
>>>>>>> REPLACE
```
"#;

const EXAMPLE_CREATE_REQUEST: &str = "Move hello() into its own file.";

const EXAMPLE_CREATE_REPLY: &str = r#"This creates `hello.py` and updates `main.py`:

1. Create hello.py containing hello().
2. Replace hello() in main.py with an import.

Here are the *SEARCH/REPLACE* blocks:

```
hello.py
<<<<<<< SEARCH
=======
def hello():
    "print a greeting"
    print("hello")
>>>>>>> REPLACE
```

```
main.py
<<<<<<< SEARCH
def hello():
    "print a greeting"
    print("hello")
=======
from hello import hello
>>>>>>> REPLACE
```
"#;

/// Prompt layout used by the CLI.
#[derive(Debug, Clone, Default)]
pub struct DefaultPrompts {
    pub style_guide: String,
}

impl DefaultPrompts {
    pub fn new(style_guide: impl Into<String>) -> Self {
        Self {
            style_guide: style_guide.into(),
        }
    }

    fn system_message(&self, files: &dyn FileOracle) -> String {
        let root_name = files
            .root()
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| files.root().display().to_string());
        let mut workspace = format!("- Root: {root_name}");
        let editable = files.editable_files();
        if !editable.is_empty() {
            workspace.push_str(&format!("\n- Editable files: {}", editable.join(", ")));
        }
        let read_only = files.read_only_files();
        if !read_only.is_empty() {
            workspace.push_str(&format!("\n- Read-only files: {}", read_only.join(", ")));
        }
        format!(
            "<instructions>\n{}</instructions>\n<workspace>\n{workspace}\n</workspace>\n<style_guide>\n{}\n</style_guide>",
            SYSTEM_INTRO,
            self.style_guide.trim()
        )
    }
}

fn example_messages() -> Vec<ChatMessage> {
    vec![
        ChatMessage::user(EXAMPLE_EDIT_REQUEST),
        ChatMessage::assistant(EXAMPLE_EDIT_REPLY),
        ChatMessage::user(EXAMPLE_CREATE_REQUEST),
        ChatMessage::assistant(EXAMPLE_CREATE_REPLY),
    ]
}

/// Render `paths` as `<file>` elements. Files that are missing or unreadable
/// are still listed so the model knows they exist.
fn render_files(files: &dyn FileOracle, paths: &[String]) -> String {
    let mut out = String::new();
    for path in paths {
        let body = match files.read_content(path) {
            Ok(Some(content)) => content,
            Ok(None) => "(file does not exist yet)\n".to_string(),
            Err(err) => format!("(unreadable: {err})\n"),
        };
        out.push_str(&format!("<file path=\"{path}\">\n{body}"));
        if !body.ends_with('\n') {
            out.push('\n');
        }
        out.push_str("</file>\n");
    }
    out
}

impl PromptBuilder for DefaultPrompts {
    fn collect_messages(
        &self,
        files: &dyn FileOracle,
        history: &[ChatMessage],
    ) -> Result<Vec<ChatMessage>> {
        let mut messages = vec![ChatMessage::system(self.system_message(files))];
        messages.extend(example_messages());

        let read_only = files.read_only_files();
        if !read_only.is_empty() {
            messages.push(ChatMessage::user(format!(
                "Here are some read-only files for reference. Do not edit them.\n<read_only_files>\n{}</read_only_files>",
                render_files(files, &read_only)
            )));
            messages.push(ChatMessage::assistant(
                "Ok, I will use these files as references.",
            ));
        }

        messages.extend_from_slice(history);
        messages.push(ChatMessage::user(RULES_REMINDER));
        messages.push(ChatMessage::assistant(RULES_ACK));

        let editable = files.editable_files();
        if !editable.is_empty() {
            messages.push(ChatMessage::user(format!(
                "These files are in the workspace and you may edit them.\n<editable_files>\n{}</editable_files>",
                render_files(files, &editable)
            )));
            messages.push(ChatMessage::assistant(
                "Ok, any changes I propose will be to those files.",
            ));
        }
        Ok(messages)
    }
}
