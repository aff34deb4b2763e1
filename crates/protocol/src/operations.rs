//! Operation catalog (Script → Host)
//!
//! The closed set of named host operations a script instance may invoke.

use serde::{Deserialize, Serialize};

/// How an operation interacts with the calling script instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Records a side effect; the result carries no information
    FireAndForget,
    /// Answers immediately from host state
    Query,
    /// May park the instance until a duration elapses or a condition holds
    Suspending,
}

/// All operations a script can request from the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    // === Suspending ===
    Sleep,
    HttpFetch,
    WaitShared,

    // === Logging ===
    Log,
    Warn,
    Error,

    // === Run context ===
    GetTestcase,
    Response,
    SetEnv,
    GetEnv,
    AddHeader,
    AddParams,

    // === Shared state ===
    SetShared,
    GetShared,

    // === Assertions & tests ===
    OpenTest,
    CloseTest,
    AppendAssert,
    TestSkip,
    Assert,
    AssertNlp,
    Equal,

    // === NLP ===
    NlpKeywords,
    NlpTags,
    NlpTagFilter,
    NlpSimilarity,
}

impl Operation {
    pub const ALL: [Operation; 25] = [
        Self::Sleep,
        Self::HttpFetch,
        Self::WaitShared,
        Self::Log,
        Self::Warn,
        Self::Error,
        Self::GetTestcase,
        Self::Response,
        Self::SetEnv,
        Self::GetEnv,
        Self::AddHeader,
        Self::AddParams,
        Self::SetShared,
        Self::GetShared,
        Self::OpenTest,
        Self::CloseTest,
        Self::AppendAssert,
        Self::TestSkip,
        Self::Assert,
        Self::AssertNlp,
        Self::Equal,
        Self::NlpKeywords,
        Self::NlpTags,
        Self::NlpTagFilter,
        Self::NlpSimilarity,
    ];

    /// Wire name used by the script bindings
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Sleep => "sleep",
            Self::HttpFetch => "http_fetch",
            Self::WaitShared => "wait_shared",
            Self::Log => "log",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::GetTestcase => "get_testcase",
            Self::Response => "response",
            Self::SetEnv => "set_env",
            Self::GetEnv => "get_env",
            Self::AddHeader => "add_header",
            Self::AddParams => "add_params",
            Self::SetShared => "set_shared",
            Self::GetShared => "get_shared",
            Self::OpenTest => "open_test",
            Self::CloseTest => "close_test",
            Self::AppendAssert => "append_assert",
            Self::TestSkip => "test_skip",
            Self::Assert => "assert",
            Self::AssertNlp => "assert_nlp",
            Self::Equal => "equal",
            Self::NlpKeywords => "nlp_keywords",
            Self::NlpTags => "nlp_tags",
            Self::NlpTagFilter => "nlp_tag_filter",
            Self::NlpSimilarity => "nlp_similarity",
        }
    }

    /// Look up an operation by wire name
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|op| op.name() == name)
    }

    #[must_use]
    pub const fn kind(&self) -> OperationKind {
        match self {
            Self::Sleep | Self::HttpFetch | Self::WaitShared => OperationKind::Suspending,
            Self::Log
            | Self::Warn
            | Self::Error
            | Self::SetEnv
            | Self::AddHeader
            | Self::AddParams
            | Self::SetShared
            | Self::OpenTest
            | Self::CloseTest
            | Self::AppendAssert
            | Self::TestSkip => OperationKind::FireAndForget,
            Self::GetTestcase
            | Self::Response
            | Self::GetEnv
            | Self::GetShared
            | Self::Assert
            | Self::AssertNlp
            | Self::Equal
            | Self::NlpKeywords
            | Self::NlpTags
            | Self::NlpTagFilter
            | Self::NlpSimilarity => OperationKind::Query,
        }
    }

    /// Number of positional arguments the operation takes
    #[must_use]
    pub const fn arity(&self) -> usize {
        match self {
            Self::GetTestcase | Self::Response | Self::TestSkip => 0,
            Self::Sleep
            | Self::HttpFetch
            | Self::WaitShared
            | Self::Log
            | Self::Warn
            | Self::Error
            | Self::GetEnv
            | Self::GetShared
            | Self::OpenTest
            | Self::CloseTest
            | Self::NlpTags => 1,
            Self::SetEnv
            | Self::AddHeader
            | Self::AddParams
            | Self::SetShared
            | Self::AppendAssert
            | Self::Assert
            | Self::Equal
            | Self::NlpKeywords
            | Self::NlpTagFilter
            | Self::NlpSimilarity => 2,
            Self::AssertNlp => 3,
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
