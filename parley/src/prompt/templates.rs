//! Prompt template data and the built-in template set.

use serde::{Deserialize, Serialize};

use crate::extract::{ANSWER_CUE, AnswerRecord, extract_document};
use crate::task::{TaskInput, TaskType};
use crate::truncate::StopSet;

use super::render::{CODE_LABEL, QUESTION_LABEL};

/// A worked input/output pair shown to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exemplar {
    /// The exemplar's input.
    pub input: TaskInput,
    /// The exemplar's answer.
    pub output: AnswerRecord,
}

/// Immutable prompt template of one task type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTemplate {
    /// Task the template serves.
    pub task: TaskType,
    /// Fixed text at the top of the prompt.
    pub preamble: String,
    /// Worked exemplars, in order.
    pub exemplars: Vec<Exemplar>,
    /// Comment line closing every exchange.
    pub end_marker: String,
    /// Text ending the prompt; generation continues from it.
    pub cue: String,
    /// Markers that end the generated answer.
    pub stop: StopSet,
}

impl PromptTemplate {
    /// Creates a template without exemplars.
    ///
    /// The stop set is the end marker followed by the input labels, so
    /// generation ends both at the end of the answer and if the model starts
    /// inventing the next exchange.
    #[must_use]
    pub fn new(task: TaskType, preamble: impl Into<String>, end_marker: impl Into<String>) -> Self {
        let end_marker = end_marker.into();
        Self {
            task,
            preamble: preamble.into(),
            exemplars: Vec::new(),
            stop: StopSet::new([end_marker.as_str(), QUESTION_LABEL, CODE_LABEL]),
            end_marker,
            cue: ANSWER_CUE.to_owned(),
        }
    }

    /// Adds an exemplar whose answer is written in the answer grammar.
    #[must_use]
    pub fn with_exemplar(mut self, input: TaskInput, document: &str) -> Self {
        let output = extract_document(Some(self.task), document);
        self.exemplars.push(Exemplar { input, output });
        self
    }
}

/// An exemplar of the suggestion template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuggestionExemplar {
    /// The exemplar's input.
    pub input: TaskInput,
    /// The exemplar's answer text.
    pub answer: String,
    /// Follow-up questions; the first `count` are shown.
    pub questions: Vec<String>,
}

/// Template of the suggestion pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuggestionTemplate {
    /// Fixed text at the top of the prompt.
    pub preamble: String,
    /// Worked exemplars, in order.
    pub exemplars: Vec<SuggestionExemplar>,
    /// Comment line introducing the list.
    pub list_header: String,
    /// Comment line closing every exemplar.
    pub end_marker: String,
}

/// Largest supported suggestion count.
pub const MAX_SUGGESTIONS: usize = 5;

const ASK_QUESTION_PREAMBLE: &str = "\
// You are a patient teaching assistant for an introductory C programming course.
// Answer the student's question in plain language. Wrap identifiers, keywords
// and library functions in backticks. List the library functions you mention
// and give short examples when they help.";

const ASK_FROM_CODE_PREAMBLE: &str = "\
// You are a patient teaching assistant for an introductory C programming course.
// The student shares a piece of code and asks a question about it. Answer the
// question, quote the relevant lines with an explanation each, and list the
// library functions involved. Wrap identifiers in backticks.";

const EXPLAIN_CODE_PREAMBLE: &str = "\
// You are a patient teaching assistant for an introductory C programming course.
// Summarize what the student's code does, then explain it line by line.
// Wrap identifiers in backticks.";

const FIX_CODE_PREAMBLE: &str = "\
// You are a patient teaching assistant for an introductory C programming course.
// The student describes a problem with their code. Explain the cause of the
// problem, then show the corrected lines with an explanation each. Wrap
// identifiers in backticks.";

const WRITE_CODE_PREAMBLE: &str = "\
// You are a patient teaching assistant for an introductory C programming course.
// Write short, idiomatic C that does what the student asks. Explain the
// approach, then each line, and list the library functions you use. Wrap
// identifiers in backticks.";

const SUGGESTION_PREAMBLE: &str = "\
// A student asked a question about C programming and received the answer below.
// Suggest short follow-up questions the student could ask next to deepen their
// understanding. Each question must make sense on its own.";

/// Follow-up preamble inserted before the transcript of earlier turns.
pub const FOLLOW_UP_PREAMBLE: &str = "\
// The student is following up on the conversation below. Use it as context
// for the next answer.";

/// Built-in template of `task`.
#[must_use]
pub fn builtin(task: TaskType) -> PromptTemplate {
    match task {
        TaskType::AskQuestion => ask_question(),
        TaskType::AskFromCode => ask_from_code(),
        TaskType::ExplainCode => explain_code(),
        TaskType::FixCode => fix_code(),
        TaskType::WriteCode => write_code(),
    }
}

fn ask_question() -> PromptTemplate {
    PromptTemplate::new(
        TaskType::AskQuestion,
        ASK_QUESTION_PREAMBLE,
        "// [end-question-answer]",
    )
    .with_exemplar(
        TaskInput::question("How do I print an integer?"),
        r#""answer": "Use `printf` with the `%d` conversion specifier. The format string comes first, followed by the value to print."
"functions": [
  ["printf", "writes formatted output to `stdout`"],
]
"examples": [
  "printf(\"%d\\n\", count);",
]"#,
    )
    .with_exemplar(
        TaskInput::question("What is the difference between `=` and `==`?"),
        r#""answer": "`=` assigns a value to a variable, while `==` compares two values and yields `1` when they are equal and `0` otherwise.\n\nWriting `if (x = 5)` assigns instead of comparing, so the condition is always true."
"examples": [
  "x = 5;",
  "if (x == 5) { puts(\"five\"); }",
]"#,
    )
    .with_exemplar(
        TaskInput::question("How can I read a line of text from the keyboard?"),
        r#""answer": "Use `fgets` with `stdin`. It reads at most one less than the buffer size and keeps the newline if there is room for it."
"functions": [
  ["fgets", "reads a line from a stream into a buffer"],
  ["strcspn", "returns the length of the prefix not containing any of the given characters"],
]
"examples": [
  "char line[100];\nfgets(line, sizeof line, stdin);\nline[strcspn(line, \"\\n\")] = '\\0';",
]"#,
    )
}

fn ask_from_code() -> PromptTemplate {
    PromptTemplate::new(
        TaskType::AskFromCode,
        ASK_FROM_CODE_PREAMBLE,
        "// [end-code-question-answer]",
    )
    .with_exemplar(
        TaskInput::question("Why does this print 0?")
            .with_code("int a = 1, b = 2;\nprintf(\"%d\\n\", a / b);"),
        r#""answer": "Both operands are `int`, so `a / b` is integer division and the fractional part is discarded. Convert one operand to `double` and print it with `%f`."
"code": [
  ["printf(\"%f\\n\", (double)a / b);", "the cast makes the division floating point"],
]
"functions": [
  ["printf", "writes formatted output to `stdout`"],
]"#,
    )
    .with_exemplar(
        TaskInput::question("What does the `&` do here?").with_code("int n;\nscanf(\"%d\", &n);"),
        r#""answer": "`&n` is the address of `n`. `scanf` needs to know where to store the value it reads, so it takes a pointer instead of the variable itself."
"code": [
  ["scanf(\"%d\", &n);", "passes the address of `n` so `scanf` can write to it"],
]
"functions": [
  ["scanf", "reads formatted input from `stdin`"],
]"#,
    )
}

fn explain_code() -> PromptTemplate {
    PromptTemplate::new(
        TaskType::ExplainCode,
        EXPLAIN_CODE_PREAMBLE,
        "// [end-code-explanation]",
    )
    .with_exemplar(
        TaskInput::code("int sum = 0;\nfor (int i = 1; i <= 10; i++)\n    sum += i;"),
        r#""answer": "Adds the numbers from 1 to 10 and stores the total in `sum`."
"code": [
  ["int sum = 0;", "starts the running total at `0`"],
  ["for (int i = 1; i <= 10; i++)", "repeats the body for `i` from 1 to 10"],
  ["    sum += i;", "adds the current value of `i` to `sum`"],
]"#,
    )
    .with_exemplar(
        TaskInput::code("char *s = malloc(16);\nif (s == NULL)\n    return 1;\nfree(s);"),
        r#""answer": "Allocates 16 bytes on the heap, stops if the allocation failed, and releases the memory again."
"code": [
  ["char *s = malloc(16);", "requests 16 bytes and keeps the address in `s`"],
  ["if (s == NULL)", "checks whether `malloc` failed"],
  ["    return 1;", "leaves with an error status"],
  ["free(s);", "returns the memory to the allocator"],
]"#,
    )
}

fn fix_code() -> PromptTemplate {
    PromptTemplate::new(TaskType::FixCode, FIX_CODE_PREAMBLE, "// [end-code-fix]")
        .with_exemplar(
            TaskInput::question("The loop never stops.")
                .with_code("int i = 0;\nwhile (i < 10)\n    printf(\"%d\\n\", i);"),
            r#""answer": "`i` is never changed inside the loop, so `i < 10` stays true forever. Increment `i` in the loop body."
"code": [
  ["int i = 0;"],
  ["while (i < 10) {"],
  ["    printf(\"%d\\n\", i);"],
  ["    i++;", "moves `i` towards the end condition"],
  ["}", "braces group both statements into the loop body"],
]"#,
        )
        .with_exemplar(
            TaskInput::question("My program crashes when I copy the name.")
                .with_code("char name[4];\nstrcpy(name, \"Alice\");"),
            r#""answer": "`\"Alice\"` needs 6 bytes including the terminating `'\\0'`, but `name` only has room for 4, so `strcpy` writes past the end of the array."
"code": [
  ["char name[6];", "makes room for five letters and the terminator"],
  ["strcpy(name, \"Alice\");"],
]"#,
        )
}

fn write_code() -> PromptTemplate {
    PromptTemplate::new(TaskType::WriteCode, WRITE_CODE_PREAMBLE, "// [end-code-writing]")
        .with_exemplar(
            TaskInput::question("Swap two integers using a function."),
            r#""answer": "Pass pointers to both integers so the function can change the caller's variables, and use a temporary to hold one value."
"code": [
  ["void swap(int *a, int *b) {", "takes the addresses of the two integers"],
  ["    int tmp = *a;", "saves the first value"],
  ["    *a = *b;", "copies the second value into the first"],
  ["    *b = tmp;", "puts the saved value into the second"],
  ["}"],
]
"examples": [
  "swap(&x, &y);",
]"#,
        )
        .with_exemplar(
            TaskInput::question("Count the characters in a string without `strlen`."),
            r#""answer": "Walk the string until the terminating `'\\0'` and count the steps."
"code": [
  ["size_t length(const char *s) {"],
  ["    size_t n = 0;", "counts characters seen so far"],
  ["    while (s[n] != '\\0')", "stops at the terminator"],
  ["        n++;"],
  ["    return n;"],
  ["}"],
]
"functions": [
  ["strlen", "the library function this replaces"],
]"#,
        )
}

/// Built-in suggestion template.
#[must_use]
pub fn builtin_suggestions() -> SuggestionTemplate {
    let exemplar = |input: TaskInput, answer: &str, questions: [&str; MAX_SUGGESTIONS]| {
        SuggestionExemplar {
            input,
            answer: answer.to_owned(),
            questions: questions.into_iter().map(str::to_owned).collect(),
        }
    };
    SuggestionTemplate {
        preamble: SUGGESTION_PREAMBLE.to_owned(),
        exemplars: vec![
            exemplar(
                TaskInput::question("How do I print an integer?"),
                "Use `printf` with the `%d` conversion specifier.",
                [
                    "How do I print a floating point number?",
                    "What other conversion specifiers does `printf` support?",
                    "How do I print several values on one line?",
                    "What does the `\\n` at the end of the format string do?",
                    "How do I control the width of the printed number?",
                ],
            ),
            exemplar(
                TaskInput::question("Why does my loop never stop?")
                    .with_code("while (i < 10)\n    printf(\"%d\", i);"),
                "`i` is never changed inside the loop, so the condition stays true.",
                [
                    "When should I use a `for` loop instead of `while`?",
                    "How do I stop a loop early?",
                    "Why do I need braces around several statements?",
                    "What is an off-by-one error?",
                    "How can I debug a loop that runs too often?",
                ],
            ),
            exemplar(
                TaskInput::question("What does `malloc` return when it fails?"),
                "It returns `NULL`, so always check the result before using it.",
                [
                    "How do I release memory from `malloc`?",
                    "What is the difference between `malloc` and `calloc`?",
                    "What happens if I use memory after freeing it?",
                    "How do I grow an allocated array with `realloc`?",
                    "Why should I check for `NULL` before using a pointer?",
                ],
            ),
        ],
        list_header: "// Suggested follow-up questions:".to_owned(),
        end_marker: "// [end-suggestions]".to_owned(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn builtin_exemplars_follow_the_grammar() {
        for task in TaskType::ALL {
            let template = builtin(task);
            assert_eq!(template.task, task);
            assert!(
                (2..=4).contains(&template.exemplars.len()),
                "{task} has {} exemplars",
                template.exemplars.len()
            );
            for exemplar in &template.exemplars {
                assert!(!exemplar.output.malformed, "{task}: {:?}", exemplar.output.raw);
                assert!(exemplar.output.answer.is_some(), "{task}");
                assert!(exemplar.input.validate(task).is_ok(), "{task}");
            }
        }
    }

    #[test]
    fn stop_sets_start_with_end_marker() {
        for task in TaskType::ALL {
            let template = builtin(task);
            assert_eq!(template.stop.markers()[0], template.end_marker);
            assert_eq!(template.cue, ANSWER_CUE);
        }
    }

    #[test]
    fn end_markers_are_distinct() {
        let mut markers: Vec<_> = TaskType::ALL.iter().map(|t| builtin(*t).end_marker).collect();
        markers.sort();
        markers.dedup();
        assert_eq!(markers.len(), TaskType::ALL.len());
    }

    #[test]
    fn exemplar_code_is_decoded() {
        let template = builtin(TaskType::AskFromCode);
        let line = &template.exemplars[0].output.code_parts[0].lines[0];
        assert_eq!(line.code, "printf(\"%f\\n\", (double)a / b);");
    }

    #[test]
    fn suggestion_exemplars_have_enough_questions() {
        let template = builtin_suggestions();
        for exemplar in &template.exemplars {
            assert_eq!(exemplar.questions.len(), MAX_SUGGESTIONS);
        }
    }
}
