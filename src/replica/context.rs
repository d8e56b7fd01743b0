//! Call-scoped read/write intent.
//!
//! A [`RoutingContext`] is a stack of intent scopes. Pushing returns a
//! [`RoutingScope`] guard; dropping the guard (on success, error or
//! cancellation) removes exactly that scope and restores the previous
//! intent.
//!
//! # Precedence
//!
//! The innermost scope wins, except that `ForceWrite` anywhere on the stack
//! overrides `Read` and `Write` regardless of nesting order. With no scope
//! pushed the effective intent is `Write`, so unknown intent routes to the
//! primary.
//!
//! # Ambient propagation
//!
//! A context can be installed as a tokio task-local with
//! [`RoutingContext::scope`] so deeply nested code can read it without
//! threading a parameter. [`with_intent`] forks the ambient context before
//! pushing, so concurrent sibling flows (joined futures or spawned tasks)
//! never observe each other's scopes.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;

/// What a connection will be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionIntent {
    /// Read-only work; may be served by a replica.
    Read,
    /// Read-write work; served by the primary.
    Write,
    /// Primary only, overriding any `Read` scope nested inside.
    ForceWrite,
}

impl ConnectionIntent {
    /// Whether this intent must be served by the primary.
    pub fn requires_primary(&self) -> bool {
        !matches!(self, ConnectionIntent::Read)
    }
}

tokio::task_local! {
    static AMBIENT: RoutingContext;
}

#[derive(Debug, Default)]
struct ScopeStack {
    next_id: u64,
    scopes: Vec<(u64, ConnectionIntent)>,
}

impl ScopeStack {
    fn current(&self) -> Option<ConnectionIntent> {
        if self
            .scopes
            .iter()
            .any(|(_, intent)| *intent == ConnectionIntent::ForceWrite)
        {
            return Some(ConnectionIntent::ForceWrite);
        }
        self.scopes.last().map(|(_, intent)| *intent)
    }
}

/// A stack of intent scopes owned by one logical call flow.
///
/// Clones share the same stack; use [`RoutingContext::fork`] for an
/// independent copy.
#[derive(Debug, Clone, Default)]
pub struct RoutingContext {
    stack: Arc<Mutex<ScopeStack>>,
}

impl RoutingContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Push an intent. The returned guard pops it when dropped.
    #[must_use = "the scope is popped as soon as the guard is dropped"]
    pub fn push_scope(&self, intent: ConnectionIntent) -> RoutingScope {
        let mut stack = self.stack.lock();
        let id = stack.next_id;
        stack.next_id += 1;
        stack.scopes.push((id, intent));
        RoutingScope {
            stack: Arc::clone(&self.stack),
            id,
            intent,
        }
    }

    /// Pop a scope explicitly. Equivalent to dropping the guard.
    pub fn pop_scope(&self, scope: RoutingScope) {
        drop(scope);
    }

    /// Intent chosen by the precedence rule, or `None` with no scope pushed.
    pub fn current_intent(&self) -> Option<ConnectionIntent> {
        self.stack.lock().current()
    }

    /// Current intent, defaulting to `Write`.
    pub fn effective_intent(&self) -> ConnectionIntent {
        self.current_intent().unwrap_or(ConnectionIntent::Write)
    }

    /// Number of scopes pushed.
    pub fn depth(&self) -> usize {
        self.stack.lock().scopes.len()
    }

    /// An independent context starting with a copy of this stack.
    ///
    /// Scopes pushed on the fork are invisible here and vice versa. Scopes
    /// copied into the fork stay until the fork is dropped.
    pub fn fork(&self) -> RoutingContext {
        let stack = self.stack.lock();
        RoutingContext {
            stack: Arc::new(Mutex::new(ScopeStack {
                next_id: stack.next_id,
                scopes: stack.scopes.clone(),
            })),
        }
    }

    /// Run `fut` with this context installed as the task's ambient context.
    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        AMBIENT.scope(self, fut).await
    }

    /// The ambient context of the current task, if one is installed.
    pub fn ambient() -> Option<RoutingContext> {
        AMBIENT.try_with(|ctx| ctx.clone()).ok()
    }

    /// The ambient effective intent, `Write` outside any context.
    pub fn ambient_intent() -> ConnectionIntent {
        AMBIENT
            .try_with(|ctx| ctx.effective_intent())
            .unwrap_or(ConnectionIntent::Write)
    }
}

/// Guard for a pushed scope.
#[derive(Debug)]
pub struct RoutingScope {
    stack: Arc<Mutex<ScopeStack>>,
    id: u64,
    intent: ConnectionIntent,
}

impl RoutingScope {
    /// The intent this scope pushed.
    pub fn intent(&self) -> ConnectionIntent {
        self.intent
    }
}

impl Drop for RoutingScope {
    fn drop(&mut self) {
        // Remove by id so out-of-order drops still restore the right intent.
        self.stack.lock().scopes.retain(|(id, _)| *id != self.id);
    }
}

/// Run `fut` with `intent` pushed onto a fork of the ambient context.
pub async fn with_intent<F: Future>(intent: ConnectionIntent, fut: F) -> F::Output {
    let context = RoutingContext::ambient()
        .map(|ctx| ctx.fork())
        .unwrap_or_default();
    let _scope = context.push_scope(intent);
    context.clone().scope(fut).await
}
