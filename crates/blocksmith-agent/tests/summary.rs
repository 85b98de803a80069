use blocksmith_agent::summarize_oneline;
use blocksmith_core::LlmConfig;
use blocksmith_llm::LlmError;
use blocksmith_testkit::{ScriptedLlm, Step};

#[test]
fn summary_keeps_the_first_non_blank_line() {
    let llm = ScriptedLlm::replies(["\n  Rename greet to welcome  \nand tidy imports\n".to_string()]);
    let summary =
        summarize_oneline(&llm, &LlmConfig::default(), "diff --git a/app.py b/app.py").expect("summary");
    assert_eq!(summary, "Rename greet to welcome");

    let requests = llm.requests();
    assert_eq!(requests.len(), 1);
    let sent = &requests[0].messages;
    assert_eq!(sent.len(), 3);
    assert_eq!(sent[0].content(), "Please summarize these changes in a single line:");
    assert_eq!(sent[1].role(), "assistant");
    assert_eq!(sent[2].content(), "diff --git a/app.py b/app.py");
}

#[test]
fn blank_summary_is_an_empty_response() {
    let llm = ScriptedLlm::new(vec![Step::Empty]);
    let err = summarize_oneline(&llm, &LlmConfig::default(), "anything").expect_err("empty");
    assert!(matches!(err.downcast_ref::<LlmError>(), Some(LlmError::Empty)));
}

#[test]
fn transport_failure_propagates() {
    let llm = ScriptedLlm::new(vec![Step::Fail("connection reset".to_string())]);
    let err = summarize_oneline(&llm, &LlmConfig::default(), "anything").expect_err("fail");
    assert!(err.to_string().contains("connection reset"));
}
