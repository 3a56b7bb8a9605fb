//! Bounded conversation memory per (task, agent) pair.
//!
//! Each context holds a fixed system preamble plus a window of turns. When a
//! new turn pushes the running total over the budget, the oldest turns are
//! evicted until it fits again. The preamble and the latest user/agent
//! exchange are never evicted; if they alone exceed the budget the context
//! stays over budget and the append reports it.
//!
//! Contexts are persisted to SQLite before `append` returns. Evicted turns are
//! flagged rather than deleted so the exported conversation log stays
//! complete.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::task::{Role, Status, Task, TaskId};

// ─── Turns ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    System,
    User,
    Assistant,
}

impl TurnRole {
    pub fn as_str(self) -> &'static str {
        match self {
            TurnRole::System => "system",
            TurnRole::User => "user",
            TurnRole::Assistant => "assistant",
        }
    }
}

impl FromStr for TurnRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "system" => Ok(TurnRole::System),
            "user" => Ok(TurnRole::User),
            "assistant" | "agent" => Ok(TurnRole::Assistant),
            _ => Err(format!("unknown turn role '{s}'")),
        }
    }
}

/// Rough token estimate: ~4 characters per token.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// One message in an agent's working memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub content: String,
    pub token_count: usize,
    pub created_at: DateTime<Utc>,
}

impl ConversationTurn {
    /// A turn whose token count is estimated from its content.
    pub fn new(role: TurnRole, content: impl Into<String>) -> Self {
        let content = content.into();
        ConversationTurn {
            role,
            token_count: estimate_tokens(&content),
            content,
            created_at: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(TurnRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(TurnRole::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(TurnRole::System, content)
    }

    /// Override the estimate with a count reported by the model provider.
    pub fn with_tokens(mut self, tokens: usize) -> Self {
        self.token_count = tokens;
        self
    }
}

// ─── Context ─────────────────────────────────────────────────────────────────

/// What an append did to the window.
#[derive(Debug, Clone, PartialEq)]
pub struct AppendReport {
    pub evicted: Vec<ConversationTurn>,
    pub token_total: usize,
    /// The protected turns alone exceed the budget.
    pub over_budget: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationContext {
    pub task_id: TaskId,
    pub agent: Role,
    pub preamble: ConversationTurn,
    /// Live turns, oldest first. Excludes the preamble.
    pub turns: Vec<ConversationTurn>,
    pub token_budget: usize,
    /// Preamble plus every live turn.
    pub token_total: usize,
    /// Persisted version; 0 until first stored.
    pub version: u64,
    pub archived: bool,
}

impl ConversationContext {
    pub fn new(
        task_id: TaskId,
        agent: Role,
        preamble: impl Into<String>,
        token_budget: usize,
    ) -> Self {
        let preamble = ConversationTurn::system(preamble);
        ConversationContext {
            task_id,
            agent,
            token_total: preamble.token_count,
            preamble,
            turns: Vec::new(),
            token_budget,
            version: 0,
            archived: false,
        }
    }

    /// Add a turn and evict oldest-first until the window fits.
    pub fn push(&mut self, turn: ConversationTurn) -> AppendReport {
        self.token_total += turn.token_count;
        self.turns.push(turn);

        let mut evictable = self.protected_from();
        let mut evicted = Vec::new();
        while self.token_total > self.token_budget && evictable > 0 {
            let old = self.turns.remove(0);
            self.token_total -= old.token_count;
            evicted.push(old);
            evictable -= 1;
        }

        AppendReport {
            evicted,
            token_total: self.token_total,
            over_budget: self.token_total > self.token_budget,
        }
    }

    /// Index of the first turn of the latest exchange: the newest turn, plus
    /// the user turn it answers if it is an assistant reply.
    fn protected_from(&self) -> usize {
        let Some(last) = self.turns.len().checked_sub(1) else {
            return 0;
        };
        if self.turns[last].role == TurnRole::Assistant
            && last > 0
            && self.turns[last - 1].role == TurnRole::User
        {
            last - 1
        } else {
            last
        }
    }

    /// Preamble followed by the live turns, in order.
    pub fn window(&self) -> Vec<ConversationTurn> {
        std::iter::once(self.preamble.clone())
            .chain(self.turns.iter().cloned())
            .collect()
    }
}

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("context {task}/{agent} kept changing underneath us ({attempts} attempts)")]
    VersionConflict {
        task: TaskId,
        agent: Role,
        attempts: u32,
    },
    #[error("context {task}/{agent} is archived")]
    Archived { task: TaskId, agent: Role },
    #[error("{task} is {status}; only COMPLETED or REJECTED tasks can be archived")]
    NotTerminal { task: TaskId, status: Status },
    #[error("no context for {task}/{agent}")]
    NotFound { task: TaskId, agent: Role },
    #[error("corrupt context data: {0}")]
    Corrupt(String),
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// ─── Manager ─────────────────────────────────────────────────────────────────

/// Persistent store of conversation contexts.
pub struct ContextManager {
    db: Mutex<Connection>,
    /// Where markdown conversation logs are written, if anywhere.
    export_dir: Option<PathBuf>,
    default_budget: usize,
    retries: u32,
}

fn default_preamble(task: &TaskId, agent: Role) -> String {
    format!("You are the {agent} agent in a coordinated development team, working on task {task}.")
}

impl ContextManager {
    /// Open or create the context database.
    pub fn open(path: &Path, default_budget: usize) -> Result<Self, ContextError> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir).map_err(|source| ContextError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn, default_budget)
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory(default_budget: usize) -> Result<Self, ContextError> {
        Self::init(Connection::open_in_memory()?, default_budget)
    }

    fn init(conn: Connection, default_budget: usize) -> Result<Self, ContextError> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS contexts (
                task_id         TEXT NOT NULL,
                agent           TEXT NOT NULL,
                preamble        TEXT NOT NULL,
                preamble_tokens INTEGER NOT NULL,
                preamble_at     TEXT NOT NULL,
                token_budget    INTEGER NOT NULL,
                token_total     INTEGER NOT NULL,
                version         INTEGER NOT NULL,
                archived        INTEGER NOT NULL DEFAULT 0,
                updated_at      TEXT NOT NULL,
                PRIMARY KEY (task_id, agent)
            );

            CREATE TABLE IF NOT EXISTS turns (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id     TEXT NOT NULL,
                agent       TEXT NOT NULL,
                seq         INTEGER NOT NULL,
                role        TEXT NOT NULL,
                content     TEXT NOT NULL,
                token_count INTEGER NOT NULL,
                created_at  TEXT NOT NULL,
                evicted     INTEGER NOT NULL DEFAULT 0,
                UNIQUE(task_id, agent, seq)
            );

            CREATE INDEX IF NOT EXISTS idx_turns_context ON turns(task_id, agent, evicted);
            ",
        )?;
        Ok(ContextManager {
            db: Mutex::new(conn),
            export_dir: None,
            default_budget,
            retries: 5,
        })
    }

    /// Write a markdown conversation log under `dir` after every append.
    pub fn with_export_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.export_dir = Some(dir.into());
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Create the context with an explicit preamble and budget if it does not
    /// exist yet. Returns the stored context either way.
    pub fn ensure(
        &self,
        task: &TaskId,
        agent: Role,
        preamble: &str,
        budget: Option<usize>,
    ) -> Result<ConversationContext, ContextError> {
        let db = self.db.lock();
        if let Some(ctx) = load(&db, task, agent)? {
            return Ok(ctx);
        }
        let mut ctx = ConversationContext::new(
            task.clone(),
            agent,
            preamble,
            budget.unwrap_or(self.default_budget),
        );
        db.execute(
            "INSERT OR IGNORE INTO contexts
                (task_id, agent, preamble, preamble_tokens, preamble_at,
                 token_budget, token_total, version, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8)",
            params![
                task.as_str(),
                agent.as_str(),
                ctx.preamble.content,
                ctx.preamble.token_count as i64,
                ctx.preamble.created_at.to_rfc3339(),
                ctx.token_budget as i64,
                ctx.token_total as i64,
                Utc::now().to_rfc3339(),
            ],
        )?;
        match load(&db, task, agent)? {
            Some(stored) => Ok(stored),
            None => {
                ctx.version = 1;
                Ok(ctx)
            }
        }
    }

    /// Append a turn, evicting old turns as needed, and persist the result
    /// before returning.
    pub fn append(
        &self,
        task: &TaskId,
        agent: Role,
        turn: ConversationTurn,
    ) -> Result<AppendReport, ContextError> {
        let report = {
            let mut db = self.db.lock();
            let mut attempt = 0;
            loop {
                attempt += 1;
                match try_append(&mut db, task, agent, &turn, self.default_budget)? {
                    Some(report) => break report,
                    None if attempt <= self.retries => {
                        debug!(
                            task_id = %task,
                            %agent,
                            attempt,
                            "Context changed concurrently, retrying"
                        );
                    }
                    None => {
                        return Err(ContextError::VersionConflict {
                            task: task.clone(),
                            agent,
                            attempts: attempt,
                        });
                    }
                }
            }
        };

        if report.over_budget {
            warn!(
                task_id = %task,
                %agent,
                token_total = report.token_total,
                "Token budget exceeded by the latest exchange; keeping it"
            );
        } else if !report.evicted.is_empty() {
            debug!(task_id = %task, %agent, evicted = report.evicted.len(), "Evicted old turns");
        }

        if self.export_dir.is_some() {
            self.export(task, agent)?;
        }
        Ok(report)
    }

    /// Stored context, if any.
    pub fn load(
        &self,
        task: &TaskId,
        agent: Role,
    ) -> Result<Option<ConversationContext>, ContextError> {
        load(&self.db.lock(), task, agent)
    }

    /// Preamble plus live turns, in order. Never mutates anything.
    pub fn get_window(
        &self,
        task: &TaskId,
        agent: Role,
    ) -> Result<Vec<ConversationTurn>, ContextError> {
        Ok(self
            .load(task, agent)?
            .map(|ctx| ctx.window())
            .unwrap_or_default())
    }

    /// Mark a finished task's context as archived; further appends fail.
    pub fn archive(&self, task: &Task, agent: Role) -> Result<(), ContextError> {
        if !task.status.is_terminal() {
            return Err(ContextError::NotTerminal {
                task: task.id.clone(),
                status: task.status,
            });
        }
        let db = self.db.lock();
        let n = db.execute(
            "UPDATE contexts SET archived = 1, version = version + 1, updated_at = ?3
             WHERE task_id = ?1 AND agent = ?2",
            params![task.id.as_str(), agent.as_str(), Utc::now().to_rfc3339()],
        )?;
        if n == 0 {
            return Err(ContextError::NotFound {
                task: task.id.clone(),
                agent,
            });
        }
        Ok(())
    }

    /// Agents that have a context for `task`.
    pub fn agents_for(&self, task: &TaskId) -> Result<Vec<Role>, ContextError> {
        let db = self.db.lock();
        let mut stmt = db.prepare("SELECT agent FROM contexts WHERE task_id = ?1 ORDER BY agent")?;
        let names = stmt
            .query_map(params![task.as_str()], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        names
            .iter()
            .map(|n| n.parse().map_err(ContextError::Corrupt))
            .collect()
    }

    /// Short human-readable overview of one context.
    pub fn summary(&self, task: &TaskId, agent: Role) -> Result<String, ContextError> {
        let Some(ctx) = self.load(task, agent)? else {
            return Ok("No conversation history.".to_string());
        };
        let mut out = format!("# Context for {task} ({agent})\n\n");
        let _ = writeln!(out, "Turns: {}", ctx.turns.len());
        let _ = writeln!(out, "Tokens: ~{} / {}", ctx.token_total, ctx.token_budget);
        if ctx.archived {
            let _ = writeln!(out, "Archived: yes");
        }
        if !ctx.turns.is_empty() {
            out.push_str("\n## Recent turns\n");
            for turn in ctx.turns.iter().rev().take(5).rev() {
                let preview: String = turn.content.chars().take(100).collect();
                let _ = writeln!(out, "- [{}] {}", turn.role.as_str(), preview.replace('\n', " "));
            }
        }
        Ok(out)
    }

    /// Summaries of every agent's context for one task.
    pub fn shared_summary(&self, task: &TaskId) -> Result<String, ContextError> {
        let mut out = format!("# Agent contexts for {task}\n\n");
        for agent in self.agents_for(task)? {
            out.push_str(&self.summary(task, agent)?);
            out.push('\n');
        }
        Ok(out)
    }

    /// Render the full conversation log (evicted turns included) as markdown.
    pub fn render_log(&self, task: &TaskId, agent: Role) -> Result<String, ContextError> {
        let db = self.db.lock();
        let ctx = load(&db, task, agent)?.ok_or_else(|| ContextError::NotFound {
            task: task.clone(),
            agent,
        })?;
        let all = load_turns(&db, task, agent, true)?;
        drop(db);

        let evicted = all.iter().filter(|(_, evicted)| *evicted).count();
        let mut md = format!("# Conversation: {task} - {agent}\n\n");
        let _ = writeln!(md, "Turns: {} ({evicted} evicted)", all.len());
        let _ = writeln!(md, "Token total: ~{} / {}\n", ctx.token_total, ctx.token_budget);
        md.push_str("---\n\n");

        let _ = writeln!(md, "## SYSTEM (preamble)");
        let _ = writeln!(
            md,
            "*{}* ({} tokens)\n\n{}\n\n---\n",
            ctx.preamble.created_at.to_rfc3339(),
            ctx.preamble.token_count,
            ctx.preamble.content
        );
        for (turn, evicted) in &all {
            let marker = if *evicted { " [evicted]" } else { "" };
            let _ = writeln!(md, "## {}{marker}", turn.role.as_str().to_uppercase());
            let _ = writeln!(
                md,
                "*{}* ({} tokens)\n\n{}\n\n---\n",
                turn.created_at.to_rfc3339(),
                turn.token_count,
                turn.content
            );
        }
        Ok(md)
    }

    /// Write the conversation log to the export directory.
    pub fn export(&self, task: &TaskId, agent: Role) -> Result<PathBuf, ContextError> {
        let dir = self
            .export_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));
        let md = self.render_log(task, agent)?;
        let io_err = |path: &Path, source| ContextError::Io {
            path: path.to_path_buf(),
            source,
        };
        std::fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        let path = dir.join(format!("{task}_{agent}.md"));
        let tmp = dir.join(format!(".{task}_{agent}.md.tmp"));
        std::fs::write(&tmp, md).map_err(|e| io_err(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| io_err(&path, e))?;
        Ok(path)
    }
}

// ─── SQL helpers ─────────────────────────────────────────────────────────────

fn parse_time(s: &str) -> Result<DateTime<Utc>, ContextError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ContextError::Corrupt(format!("bad timestamp '{s}': {e}")))
}

struct ContextRow {
    preamble: String,
    preamble_tokens: i64,
    preamble_at: String,
    token_budget: i64,
    token_total: i64,
    version: i64,
    archived: bool,
}

fn load(
    db: &Connection,
    task: &TaskId,
    agent: Role,
) -> Result<Option<ConversationContext>, ContextError> {
    let row = db
        .query_row(
            "SELECT preamble, preamble_tokens, preamble_at, token_budget, token_total,
                    version, archived
             FROM contexts WHERE task_id = ?1 AND agent = ?2",
            params![task.as_str(), agent.as_str()],
            |row| {
                Ok(ContextRow {
                    preamble: row.get(0)?,
                    preamble_tokens: row.get(1)?,
                    preamble_at: row.get(2)?,
                    token_budget: row.get(3)?,
                    token_total: row.get(4)?,
                    version: row.get(5)?,
                    archived: row.get::<_, i64>(6)? != 0,
                })
            },
        )
        .optional()?;
    let Some(row) = row else {
        return Ok(None);
    };

    let turns = load_turns(db, task, agent, false)?
        .into_iter()
        .map(|(turn, _)| turn)
        .collect();
    Ok(Some(ConversationContext {
        task_id: task.clone(),
        agent,
        preamble: ConversationTurn {
            role: TurnRole::System,
            content: row.preamble,
            token_count: row.preamble_tokens as usize,
            created_at: parse_time(&row.preamble_at)?,
        },
        turns,
        token_budget: row.token_budget as usize,
        token_total: row.token_total as usize,
        version: row.version as u64,
        archived: row.archived,
    }))
}

fn load_turns(
    db: &Connection,
    task: &TaskId,
    agent: Role,
    include_evicted: bool,
) -> Result<Vec<(ConversationTurn, bool)>, ContextError> {
    let mut stmt = db.prepare(
        "SELECT role, content, token_count, created_at, evicted FROM turns
         WHERE task_id = ?1 AND agent = ?2 AND (?3 OR evicted = 0)
         ORDER BY seq ASC",
    )?;
    let rows = stmt
        .query_map(params![task.as_str(), agent.as_str(), include_evicted], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)? != 0,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(role, content, tokens, at, evicted)| {
            let role: TurnRole = role.parse().map_err(ContextError::Corrupt)?;
            Ok((
                ConversationTurn {
                    role,
                    content,
                    token_count: tokens as usize,
                    created_at: parse_time(&at)?,
                },
                evicted,
            ))
        })
        .collect()
}

/// One optimistic append. `Ok(None)` means the stored version moved between
/// our read and our write.
fn try_append(
    db: &mut Connection,
    task: &TaskId,
    agent: Role,
    turn: &ConversationTurn,
    default_budget: usize,
) -> Result<Option<AppendReport>, ContextError> {
    let mut ctx = match load(db, task, agent)? {
        Some(ctx) => ctx,
        None => {
            let preamble = default_preamble(task, agent);
            ConversationContext::new(task.clone(), agent, preamble, default_budget)
        }
    };
    if ctx.archived {
        return Err(ContextError::Archived {
            task: task.clone(),
            agent,
        });
    }
    let report = ctx.push(turn.clone());
    let now = Utc::now().to_rfc3339();

    let tx = db.transaction()?;
    let written = if ctx.version == 0 {
        tx.execute(
            "INSERT OR IGNORE INTO contexts
                (task_id, agent, preamble, preamble_tokens, preamble_at,
                 token_budget, token_total, version, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8)",
            params![
                task.as_str(),
                agent.as_str(),
                ctx.preamble.content,
                ctx.preamble.token_count as i64,
                ctx.preamble.created_at.to_rfc3339(),
                ctx.token_budget as i64,
                ctx.token_total as i64,
                now,
            ],
        )?
    } else {
        tx.execute(
            "UPDATE contexts SET token_total = ?3, version = version + 1, updated_at = ?4
             WHERE task_id = ?1 AND agent = ?2 AND version = ?5",
            params![
                task.as_str(),
                agent.as_str(),
                ctx.token_total as i64,
                now,
                ctx.version as i64,
            ],
        )?
    };
    if written == 0 {
        // Dropping the transaction rolls it back.
        return Ok(None);
    }

    if !report.evicted.is_empty() {
        tx.execute(
            "UPDATE turns SET evicted = 1 WHERE id IN (
                SELECT id FROM turns WHERE task_id = ?1 AND agent = ?2 AND evicted = 0
                ORDER BY seq ASC LIMIT ?3)",
            params![task.as_str(), agent.as_str(), report.evicted.len() as i64],
        )?;
    }
    let next_seq: i64 = tx.query_row(
        "SELECT COALESCE(MAX(seq), 0) + 1 FROM turns WHERE task_id = ?1 AND agent = ?2",
        params![task.as_str(), agent.as_str()],
        |row| row.get(0),
    )?;
    tx.execute(
        "INSERT INTO turns (task_id, agent, seq, role, content, token_count, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            task.as_str(),
            agent.as_str(),
            next_seq,
            turn.role.as_str(),
            turn.content,
            turn.token_count as i64,
            turn.created_at.to_rfc3339(),
        ],
    )?;
    tx.commit()?;
    Ok(Some(report))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(id: &str) -> TaskId {
        TaskId::from(id)
    }

    #[test]
    fn eviction_keeps_total_within_budget() {
        let mut ctx = ConversationContext::new(t("T-001"), Role::Dev1, "", 100);
        for i in 0..20 {
            let role = if i % 2 == 0 { TurnRole::User } else { TurnRole::Assistant };
            let report = ctx.push(ConversationTurn::new(role, format!("turn {i}")).with_tokens(15));
            assert!(ctx.token_total <= ctx.token_budget, "after turn {i}");
            assert!(!report.over_budget);
        }
        assert_eq!(ctx.token_total, ctx.turns.iter().map(|t| t.token_count).sum::<usize>());
        assert_eq!(ctx.turns.last().unwrap().content, "turn 19");
    }

    #[test]
    fn eviction_is_oldest_first_and_spares_preamble() {
        let mut ctx = ConversationContext::new(t("T-001"), Role::Dev1, "be terse", 40);
        let preamble_tokens = ctx.preamble.token_count;
        ctx.push(ConversationTurn::user("a").with_tokens(10));
        ctx.push(ConversationTurn::assistant("b").with_tokens(10));
        ctx.push(ConversationTurn::user("c").with_tokens(10));
        let report = ctx.push(ConversationTurn::assistant("d").with_tokens(10));

        let contents: Vec<&str> = report.evicted.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["a"]);
        assert_eq!(ctx.preamble.content, "be terse");
        assert_eq!(ctx.token_total, preamble_tokens + 30);
        assert!(ctx.token_total <= 40);
    }

    #[test]
    fn oversized_latest_exchange_is_kept_and_flagged() {
        let mut ctx = ConversationContext::new(t("T-001"), Role::Dev1, "", 50);
        ctx.push(ConversationTurn::user("old").with_tokens(10));
        ctx.push(ConversationTurn::user("question").with_tokens(30));
        let report = ctx.push(ConversationTurn::assistant("huge answer").with_tokens(40));

        assert!(report.over_budget);
        assert_eq!(report.evicted.len(), 1);
        let kept: Vec<&str> = ctx.turns.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(kept, vec!["question", "huge answer"]);
        assert_eq!(ctx.token_total, 70);
    }

    #[test]
    fn single_oversized_turn_is_not_truncated() {
        let mut ctx = ConversationContext::new(t("T-001"), Role::Dev1, "", 10);
        let big = "x".repeat(400);
        let report = ctx.push(ConversationTurn::user(big.clone()));
        assert!(report.over_budget);
        assert_eq!(ctx.turns[0].content, big);
        assert_eq!(ctx.turns[0].token_count, 100);
    }

    #[test]
    fn estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn append_persists_and_window_is_read_only() {
        let mgr = ContextManager::in_memory(1000).unwrap();
        let task = t("T-010");
        mgr.append(&task, Role::Dev1, ConversationTurn::user("implement login")).unwrap();
        mgr.append(&task, Role::Dev1, ConversationTurn::assistant("on it")).unwrap();

        let w1 = mgr.get_window(&task, Role::Dev1).unwrap();
        let w2 = mgr.get_window(&task, Role::Dev1).unwrap();
        assert_eq!(w1, w2);
        assert_eq!(w1.len(), 3);
        assert_eq!(w1[0].role, TurnRole::System);
        assert_eq!(w1[2].content, "on it");
        assert_eq!(mgr.load(&task, Role::Dev1).unwrap().unwrap().version, 2);
    }

    #[test]
    fn contexts_are_isolated_per_task_and_agent() {
        let mgr = ContextManager::in_memory(1000).unwrap();
        mgr.append(&t("T-001"), Role::Dev1, ConversationTurn::user("one")).unwrap();
        mgr.append(&t("T-002"), Role::Dev1, ConversationTurn::user("two")).unwrap();
        mgr.append(&t("T-001"), Role::Testing, ConversationTurn::user("three")).unwrap();

        let w = mgr.get_window(&t("T-001"), Role::Dev1).unwrap();
        assert_eq!(w.len(), 2);
        assert_eq!(w[1].content, "one");
        assert_eq!(mgr.agents_for(&t("T-001")).unwrap(), vec![Role::Dev1, Role::Testing]);
        assert!(mgr.get_window(&t("T-003"), Role::Dev1).unwrap().is_empty());
    }

    #[test]
    fn evicted_turns_stay_in_the_log() {
        let mgr = ContextManager::in_memory(30).unwrap();
        let task = t("T-005");
        mgr.ensure(&task, Role::Review, "", None).unwrap();
        for i in 0..4 {
            let turn = ConversationTurn::user(format!("msg {i}")).with_tokens(10);
            mgr.append(&task, Role::Review, turn).unwrap();
        }
        let ctx = mgr.load(&task, Role::Review).unwrap().unwrap();
        assert!(ctx.token_total <= 30);
        assert_eq!(ctx.turns.len(), 3);

        let log = mgr.render_log(&task, Role::Review).unwrap();
        assert!(log.contains("msg 0"));
        assert!(log.contains("[evicted]"));
        assert!(log.contains("Turns: 4 (1 evicted)"));
    }

    #[test]
    fn reopening_reconstructs_exact_history() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("contexts.db");
        let task = t("T-007");
        let before = {
            let mgr = ContextManager::open(&db, 25).unwrap();
            mgr.ensure(&task, Role::Dev2, "sys", None).unwrap();
            for i in 0..5 {
                let turn = ConversationTurn::user(format!("u{i}")).with_tokens(7);
                mgr.append(&task, Role::Dev2, turn).unwrap();
            }
            mgr.get_window(&task, Role::Dev2).unwrap()
        };
        let mgr = ContextManager::open(&db, 25).unwrap();
        assert_eq!(mgr.get_window(&task, Role::Dev2).unwrap(), before);
    }

    #[test]
    fn export_writes_markdown_after_each_append() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = ContextManager::in_memory(100)
            .unwrap()
            .with_export_dir(dir.path().join("conversations"));
        let task = t("T-009");
        mgr.append(&task, Role::DevOps, ConversationTurn::user("merge it")).unwrap();
        let path = dir.path().join("conversations").join("T-009_DevOps.md");
        let md = std::fs::read_to_string(&path).unwrap();
        assert!(md.starts_with("# Conversation: T-009 - DevOps"));
        assert!(md.contains("merge it"));

        mgr.append(&task, Role::DevOps, ConversationTurn::assistant("merged")).unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("merged"));
    }

    #[test]
    fn archive_requires_terminal_task() {
        use crate::state::TransitionRequest;
        use crate::store::{MemoryTaskStore, Mutation, TaskStore};
        use crate::task::NewTask;

        let store = MemoryTaskStore::new();
        let task = store.create(NewTask::new("x").assigned(Role::Dev1)).unwrap();
        let mgr = ContextManager::in_memory(100).unwrap();
        mgr.append(&task.id, Role::Dev1, ConversationTurn::user("hi")).unwrap();

        assert!(matches!(
            mgr.archive(&task, Role::Dev1),
            Err(ContextError::NotTerminal { .. })
        ));

        let rejected = store
            .write(
                &task.id,
                &Mutation::Transition(TransitionRequest::new(Status::Rejected, Role::Human)),
                task.version,
            )
            .unwrap();
        mgr.archive(&rejected, Role::Dev1).unwrap();
        assert!(matches!(
            mgr.append(&task.id, Role::Dev1, ConversationTurn::user("more")),
            Err(ContextError::Archived { .. })
        ));
        // History is retained.
        assert_eq!(mgr.get_window(&task.id, Role::Dev1).unwrap().len(), 2);
    }
}
