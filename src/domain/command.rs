//! Command classification for inbound instructions.
//!
//! Commands are matched case-insensitively against a bilingual keyword
//! table. Keywords are reserved: a message whose first token is a keyword is
//! never treated as free text.

/// The argument a command needed but did not get.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgumentKind {
    RepositoryKey,
    ChangeNumber,
}

impl ArgumentKind {
    pub fn usage(&self) -> &'static str {
        match self {
            Self::RepositoryKey => "switch owner/repo",
            Self::ChangeNumber => "review-pr <number>",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    End,
    SwitchToReview,
    SwitchToImplementation,
    SwitchRepository(String),
    ListRepositories,
    SetSync,
    SetAsync,
    ListOpenChanges,
    ReviewChange(u64),
    Help,
    /// A command keyword whose argument was absent or malformed.
    MissingArgument(ArgumentKind),
    FreeText,
}

impl Command {
    /// Commands answered without creating a session.
    pub fn is_sessionless(&self) -> bool {
        matches!(self, Self::ListRepositories | Self::Help | Self::ListOpenChanges)
    }
}

/// How a keyword must appear in the message.
#[derive(Clone, Copy)]
enum Match {
    /// The whole message is the keyword.
    Exact,
    /// The first whitespace-delimited token is the keyword.
    Leading,
}

#[derive(Clone, Copy)]
enum Kind {
    End,
    ReviewChange,
    Review,
    Implement,
    Switch,
    Repos,
    Sync,
    Async,
    ListChanges,
    Help,
}

/// Ordered keyword table; first match wins. `review-pr` precedes `review`.
const KEYWORDS: &[(Kind, Match, &[&str])] = &[
    (Kind::End, Match::Exact, &["end", "終了", "おわり"]),
    (Kind::ReviewChange, Match::Leading, &["review-pr", "prレビュー"]),
    (Kind::Review, Match::Leading, &["review", "レビュー"]),
    (Kind::Implement, Match::Leading, &["implement", "実装"]),
    (Kind::Switch, Match::Leading, &["switch", "切り替え"]),
    (Kind::Repos, Match::Exact, &["repos", "repositories", "リポジトリ"]),
    (Kind::Sync, Match::Exact, &["sync", "順次"]),
    (Kind::Async, Match::Exact, &["async", "並列"]),
    (
        Kind::ListChanges,
        Match::Exact,
        &["list-prs", "prs", "pr一覧", "pr list"],
    ),
    (Kind::Help, Match::Exact, &["help", "ヘルプ", "?"]),
];

/// Classify an instruction. The input is trimmed before matching.
pub fn classify(text: &str) -> Command {
    let text = text.trim();
    if text.is_empty() {
        return Command::FreeText;
    }

    let lower = text.to_lowercase();
    let first = text.split_whitespace().next().unwrap_or_default();
    let first_lower = first.to_lowercase();
    // `first` is a prefix slice of `text`, so this offset is a char boundary.
    let rest = text[first.len()..].trim();

    for (kind, how, keywords) in KEYWORDS {
        let hit = keywords.iter().any(|kw| match how {
            Match::Exact => lower == *kw,
            Match::Leading => first_lower == *kw,
        });
        if hit {
            return build(*kind, rest);
        }
    }

    Command::FreeText
}

fn build(kind: Kind, rest: &str) -> Command {
    match kind {
        Kind::End => Command::End,
        Kind::Review => Command::SwitchToReview,
        Kind::Implement => Command::SwitchToImplementation,
        Kind::Repos => Command::ListRepositories,
        Kind::Sync => Command::SetSync,
        Kind::Async => Command::SetAsync,
        Kind::ListChanges => Command::ListOpenChanges,
        Kind::Help => Command::Help,
        Kind::Switch => match rest.split_whitespace().next() {
            Some(key) => Command::SwitchRepository(key.to_string()),
            None => Command::MissingArgument(ArgumentKind::RepositoryKey),
        },
        Kind::ReviewChange => match rest
            .split_whitespace()
            .next()
            .map(|n| n.trim_start_matches('#'))
            .and_then(|n| n.parse::<u64>().ok())
        {
            Some(number) => Command::ReviewChange(number),
            None => Command::MissingArgument(ArgumentKind::ChangeNumber),
        },
    }
}
