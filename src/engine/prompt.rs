//! Outbound instructions for the code generator.

use crate::domain::{Mode, Repository};
use crate::hosting::{Identity, PullRequestDetails};

/// Diffs longer than this are cut before they go into a review prompt.
const MAX_REVIEW_DIFF_CHARS: usize = 60_000;

/// Wrap the user's prompt with the operating rules for `mode`.
pub fn compose_instruction(
    mode: Mode,
    prompt: &str,
    repo: &Repository,
    co_author: &Identity,
) -> String {
    match mode {
        Mode::Implementation => implementation_instruction(prompt, repo, co_author),
        Mode::Review => review_instruction(prompt, repo),
    }
}

fn implementation_instruction(prompt: &str, repo: &Repository, co_author: &Identity) -> String {
    format!(
        r#"{prompt}

Repository: {key}
Default branch: {branch}

Instructions:
1. Implement the requested changes
2. Create a new feature branch with a descriptive name
3. Commit your changes with a clear commit message
4. Push the branch and open a pull request into {branch}

End every commit message with this trailer:
{trailer}

CRITICAL RULES:
- NEVER merge any branch into main/master/develop
- NEVER push directly to {branch}
- NEVER force push (git push -f, git push --force)
- Always create a feature branch, push to that branch, then open a pull request

If you cannot push, finish your reply with the complete change as a ```json block instead:
{{"pr_title": "...", "pr_body": "...", "files": [{{"path": "relative/path", "content": "full file content", "action": "create"}}]}}
Use "create" for new files and "update" for existing ones, and always give the full file content.
"#,
        prompt = prompt,
        key = repo.key(),
        branch = repo.default_branch,
        trailer = co_author.trailer(),
    )
}

fn review_instruction(prompt: &str, repo: &Repository) -> String {
    format!(
        r#"{prompt}

Repository: {key}
Default branch: {branch}

You are reviewing, not implementing:
- Do not create, modify, or delete files
- Do not commit, push, or open pull requests
- Read the relevant code and answer with concrete findings, citing files and lines
"#,
        prompt = prompt,
        key = repo.key(),
        branch = repo.default_branch,
    )
}

/// Prompt for reviewing an open pull request.
pub fn review_change_prompt(details: &PullRequestDetails, diff: &str) -> String {
    let diff_chars = diff.chars().count();
    let diff = if diff_chars > MAX_REVIEW_DIFF_CHARS {
        let cut: String = diff.chars().take(MAX_REVIEW_DIFF_CHARS).collect();
        format!(
            "{}\n... ({} more characters not shown)",
            cut,
            diff_chars - MAX_REVIEW_DIFF_CHARS
        )
    } else {
        diff.to_string()
    };
    let body = if details.body.trim().is_empty() {
        "(no description)"
    } else {
        details.body.trim()
    };

    format!(
        r#"Review pull request #{number}.

## Details
Title: {title}
Author: {author}
Branch: {head} -> {base}
URL: {url}

{body}

## Diff
```diff
{diff}
```

Review points:
- Code quality
- Potential bugs
- Performance problems
- Security concerns
- Adherence to the project's conventions
- Suggested improvements

Give detailed review comments."#,
        number = details.number,
        title = details.title,
        author = details.author,
        head = details.head,
        base = details.base,
        url = details.url,
        body = body,
        diff = diff,
    )
}
