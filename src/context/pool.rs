//! The context registry: live permanent and temporary maps, the zombie queue
//! of retired contexts awaiting close, and a bounded dead queue kept for
//! diagnostics. A context is in exactly one collection at a time.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::{ContextSnapshot, PrivacyContext};
use crate::agent::{PrivacyAgent, PrivacyAgentId};
use crate::error::PoolError;

const MAX_DEAD_CONTEXTS: usize = 100;
const THROUGHPUT_REPORT_SIZE: usize = 15;

#[derive(Default)]
struct Collections {
    permanent: HashMap<PrivacyAgentId, Arc<PrivacyContext>>,
    temporary: HashMap<PrivacyAgentId, Arc<PrivacyContext>>,
    zombie: VecDeque<Arc<PrivacyContext>>,
    dead: VecDeque<Arc<PrivacyContext>>,
}

impl Collections {
    fn live_count(&self) -> usize {
        self.permanent.len() + self.temporary.len()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub allowed: usize,
    pub permanent: Vec<ContextSnapshot>,
    pub temporary: Vec<ContextSnapshot>,
    pub zombie: Vec<ContextSnapshot>,
    pub dead: Vec<ContextSnapshot>,
}

pub struct PrivacyContextPool {
    collections: Mutex<Collections>,
    draining: tokio::sync::Mutex<()>,
    allowed: usize,
    close_grace: Duration,
}

impl PrivacyContextPool {
    pub fn new(allowed: usize, close_grace: Duration) -> Self {
        Self {
            collections: Mutex::new(Collections::default()),
            draining: tokio::sync::Mutex::new(()),
            allowed: allowed.max(1),
            close_grace,
        }
    }

    pub fn allowed(&self) -> usize {
        self.allowed
    }

    /// The live context for `agent`, created with `create` if absent.
    ///
    /// Lookup and insertion happen under one lock, so concurrent callers for
    /// the same agent id get the same instance. Creating a context beyond the
    /// allowed live count fails with `Saturated`.
    pub fn get_or_create<F>(&self, agent: &PrivacyAgent, create: F) -> Result<Arc<PrivacyContext>, PoolError>
    where
        F: FnOnce(&PrivacyAgent) -> PrivacyContext,
    {
        let mut c = self.collections.lock();
        let existing = if agent.is_permanent() {
            c.permanent.get(&agent.id)
        } else {
            c.temporary.get(&agent.id)
        };
        if let Some(context) = existing {
            return Ok(context.clone());
        }

        let active = c.live_count();
        if active >= self.allowed {
            return Err(PoolError::Saturated {
                active,
                allowed: self.allowed,
            });
        }

        let context = Arc::new(create(agent));
        let map = if agent.is_permanent() {
            &mut c.permanent
        } else {
            &mut c.temporary
        };
        map.insert(agent.id.clone(), context.clone());
        info!(
            context = %agent.display(),
            kind = ?agent.kind(),
            live = active + 1,
            allowed = self.allowed,
            "Created privacy context"
        );
        Ok(context)
    }

    /// The live context for `id`, if any.
    pub fn get(&self, id: &PrivacyAgentId) -> Option<Arc<PrivacyContext>> {
        let c = self.collections.lock();
        c.permanent.get(id).or_else(|| c.temporary.get(id)).cloned()
    }

    /// Move a live context to the head of the zombie queue. Retiring a
    /// context that is already a zombie, or already dead, is a no-op.
    /// Retiring a context the pool never owned is a lifecycle bug.
    pub fn retire(&self, context: &Arc<PrivacyContext>) -> Result<(), PoolError> {
        let mut c = self.collections.lock();
        let id = context.id();

        let removed = remove_if_same(&mut c.permanent, id, context)
            || remove_if_same(&mut c.temporary, id, context);
        if removed {
            context.dismiss();
            c.zombie.push_front(context.clone());
            debug!(context = %context, zombies = c.zombie.len(), "Retired privacy context");
            return Ok(());
        }

        let known = c
            .zombie
            .iter()
            .chain(c.dead.iter())
            .any(|z| Arc::ptr_eq(z, context));
        if known {
            Ok(())
        } else {
            Err(PoolError::NotTracked(id.to_string()))
        }
    }

    /// Retire every live context and return them.
    pub fn retire_all(&self) -> Vec<Arc<PrivacyContext>> {
        let mut guard = self.collections.lock();
        let c = &mut *guard;
        let live: Vec<_> = c
            .permanent
            .drain()
            .chain(c.temporary.drain())
            .map(|(_, ctx)| ctx)
            .collect();
        for context in &live {
            context.dismiss();
            c.zombie.push_front(context.clone());
        }
        live
    }

    /// Close every zombie that is not closed yet, then move closed zombies
    /// to the dead queue. Close failures are logged by the contexts
    /// themselves and never propagate. Returns the number moved.
    pub async fn close_dying_contexts(&self) -> usize {
        let _draining = self.draining.lock().await;

        let dying: Vec<_> = {
            let c = self.collections.lock();
            c.zombie.iter().filter(|z| !z.is_closed()).cloned().collect()
        };

        if !dying.is_empty() {
            let mut closing = JoinSet::new();
            for context in dying {
                let grace = self.close_grace;
                closing.spawn(async move { context.close(grace).await });
            }
            while let Some(joined) = closing.join_next().await {
                if let Err(e) = joined {
                    warn!(error = %e, "Privacy context close task failed");
                }
            }
        }

        let moved: Vec<_> = {
            let mut c = self.collections.lock();
            let (closed, still_dying): (Vec<_>, Vec<_>) =
                c.zombie.drain(..).partition(|z| z.is_closed());
            c.zombie = still_dying.into();
            for context in closed.iter().rev() {
                c.dead.push_front(context.clone());
            }
            c.dead.truncate(MAX_DEAD_CONTEXTS);
            closed
        };

        if !moved.is_empty() {
            self.report_throughput();
        }
        moved.len()
    }

    /// Log pages per minute of the most recently closed temporary contexts.
    fn report_throughput(&self) {
        let c = self.collections.lock();
        let recent: Vec<_> = c
            .dead
            .iter()
            .filter(|ctx| !ctx.is_permanent())
            .take(THROUGHPUT_REPORT_SIZE)
            .collect();
        if recent.is_empty() {
            return;
        }
        let rates: Vec<String> = recent
            .iter()
            .map(|ctx| {
                let minutes = ctx.elapsed().as_secs_f64() / 60.0;
                let rate = if minutes > 0.0 {
                    ctx.successes() as f64 / minutes
                } else {
                    0.0
                };
                format!("{:.2}", rate)
            })
            .collect();
        info!(
            contexts = recent.len(),
            pages_per_minute = %rates.join(", "),
            "Throughput of recently closed contexts"
        );
    }

    /// Point-in-time copy of permanent and temporary contexts.
    pub fn active_contexts(&self) -> Vec<Arc<PrivacyContext>> {
        let c = self.collections.lock();
        c.permanent.values().chain(c.temporary.values()).cloned().collect()
    }

    pub fn active_context_count(&self) -> usize {
        self.collections.lock().live_count()
    }

    pub fn temporary_contexts(&self) -> Vec<Arc<PrivacyContext>> {
        self.collections.lock().temporary.values().cloned().collect()
    }

    pub fn has_capacity(&self) -> bool {
        self.active_context_count() < self.allowed
    }

    /// A retired context with this id has not finished closing.
    pub fn is_dying(&self, id: &PrivacyAgentId) -> bool {
        self.collections
            .lock()
            .zombie
            .iter()
            .any(|z| z.id() == id && !z.is_closed())
    }

    pub fn zombie_count(&self) -> usize {
        self.collections.lock().zombie.len()
    }

    pub fn dead_count(&self) -> usize {
        self.collections.lock().dead.len()
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let c = self.collections.lock();
        PoolSnapshot {
            allowed: self.allowed,
            permanent: c.permanent.values().map(|ctx| ctx.snapshot()).collect(),
            temporary: c.temporary.values().map(|ctx| ctx.snapshot()).collect(),
            zombie: c.zombie.iter().map(|ctx| ctx.snapshot()).collect(),
            dead: c.dead.iter().map(|ctx| ctx.snapshot()).collect(),
        }
    }
}

fn remove_if_same(
    map: &mut HashMap<PrivacyAgentId, Arc<PrivacyContext>>,
    id: &PrivacyAgentId,
    context: &Arc<PrivacyContext>,
) -> bool {
    match map.get(id) {
        Some(existing) if Arc::ptr_eq(existing, context) => {
            map.remove(id);
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentRequirement;
    use crate::context::ContextState;
    use crate::fetch::FetchTask;
    use crate::driver::WebDriverPoolManager;
    use crate::fingerprint::Fingerprint;
    use crate::testing::MockLauncher;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn drivers() -> Arc<WebDriverPoolManager> {
        Arc::new(WebDriverPoolManager::new(
            Arc::new(MockLauncher::default()),
            4,
            Duration::from_secs(1),
        ))
    }

    fn factory(drivers: Arc<WebDriverPoolManager>) -> impl Fn(&PrivacyAgent) -> PrivacyContext {
        move |agent| PrivacyContext::new(agent.clone(), drivers.clone(), None, 8)
    }

    fn agent(name: &str) -> PrivacyAgent {
        PrivacyAgent::new(name, Fingerprint::default())
    }

    /// Each context instance appears in at most one collection.
    fn assert_disjoint(pool: &PrivacyContextPool) {
        let snap = pool.snapshot();
        let mut seen = std::collections::HashSet::new();
        for ctx in snap
            .permanent
            .iter()
            .chain(&snap.temporary)
            .chain(&snap.zombie)
            .chain(&snap.dead)
        {
            assert!(seen.insert(ctx.serial), "{}#{} in two collections", ctx.id, ctx.serial);
        }
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_context() {
        let pool = Arc::new(PrivacyContextPool::new(4, Duration::ZERO));
        let drivers = drivers();
        let created = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let pool = pool.clone();
                let drivers = drivers.clone();
                let created = created.clone();
                tokio::spawn(async move {
                    pool.get_or_create(&agent("A"), |a| {
                        created.fetch_add(1, Ordering::SeqCst);
                        PrivacyContext::new(a.clone(), drivers, None, 8)
                    })
                    .unwrap()
                })
            })
            .collect();

        let mut contexts = Vec::new();
        for h in handles {
            contexts.push(h.await.unwrap());
        }
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert!(contexts.iter().all(|c| Arc::ptr_eq(c, &contexts[0])));
        assert_eq!(pool.active_context_count(), 1);
    }

    #[tokio::test]
    async fn test_admission_bound_holds() {
        let pool = PrivacyContextPool::new(2, Duration::ZERO);
        let make = factory(drivers());

        let a = pool.get_or_create(&agent("A"), &make).unwrap();
        pool.get_or_create(&PrivacyAgent::system_default(), &make).unwrap();
        let err = pool.get_or_create(&agent("B"), &make).unwrap_err();
        assert!(matches!(err, PoolError::Saturated { active: 2, allowed: 2 }));
        assert!(pool.active_context_count() <= pool.allowed());

        pool.retire(&a).unwrap();
        pool.get_or_create(&agent("B"), &make).unwrap();
        assert!(pool.active_context_count() <= pool.allowed());
    }

    #[tokio::test]
    async fn test_retire_is_idempotent() {
        let pool = PrivacyContextPool::new(2, Duration::ZERO);
        let ctx = pool.get_or_create(&agent("A"), factory(drivers())).unwrap();

        pool.retire(&ctx).unwrap();
        pool.retire(&ctx).unwrap();
        assert_eq!(pool.zombie_count(), 1);
        assert_eq!(pool.active_context_count(), 0);
        assert_eq!(ctx.state(), ContextState::Retired);
        assert_disjoint(&pool);
    }

    #[tokio::test]
    async fn test_retire_untracked_is_an_error() {
        let pool = PrivacyContextPool::new(2, Duration::ZERO);
        let stray = Arc::new(factory(drivers())(&agent("A")));
        assert!(matches!(pool.retire(&stray), Err(PoolError::NotTracked(_))));
    }

    #[tokio::test]
    async fn test_zombies_drain_into_dead() {
        let pool = PrivacyContextPool::new(3, Duration::ZERO);
        let make = factory(drivers());
        let a = pool.get_or_create(&agent("A"), &make).unwrap();
        let b = pool.get_or_create(&agent("B"), &make).unwrap();
        let perm = pool.get_or_create(&PrivacyAgent::prototype(), &make).unwrap();

        pool.retire(&a).unwrap();
        pool.retire(&b).unwrap();
        assert_disjoint(&pool);

        assert_eq!(pool.close_dying_contexts().await, 2);
        assert!(a.is_closed() && b.is_closed());
        assert!(!perm.is_closed());
        assert_eq!(pool.zombie_count(), 0);
        assert_eq!(pool.dead_count(), 2);

        let snap = pool.snapshot();
        assert_eq!(snap.permanent.len(), 1);
        assert!(snap.temporary.is_empty());
        // Most recently retired first.
        assert_eq!(snap.dead[0].id, "B");

        // Already dead: retiring again is harmless.
        pool.retire(&a).unwrap();
        assert_eq!(pool.zombie_count(), 0);
    }

    #[tokio::test]
    async fn test_same_id_after_retire_gets_new_context() {
        let pool = PrivacyContextPool::new(2, Duration::ZERO);
        let make = factory(drivers());
        let first = pool.get_or_create(&agent("A"), &make).unwrap();
        pool.retire(&first).unwrap();

        let second = pool.get_or_create(&agent("A"), &make).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_ne!(first.serial(), second.serial());
        assert_disjoint(&pool);
    }

    #[tokio::test]
    async fn test_closing_retired_context_spares_its_replacement() {
        let launcher = Arc::new(MockLauncher::default());
        let drivers = Arc::new(WebDriverPoolManager::new(
            launcher.clone(),
            4,
            Duration::from_secs(1),
        ));
        let pool = PrivacyContextPool::new(2, Duration::ZERO);
        let make = factory(drivers.clone());
        let task = FetchTask::new("https://example.com", AgentRequirement::AnyTemporary);

        let old = pool.get_or_create(&agent("A"), &make).unwrap();
        old.run(&task, |_| async { Ok(()) }).await.unwrap();
        old.mark_leaked();
        pool.retire(&old).unwrap();

        let fresh = pool.get_or_create(&agent("A"), &make).unwrap();
        fresh.run(&task, |_| async { Ok(()) }).await.unwrap();
        assert_eq!(launcher.launch_count(), 2);
        assert_ne!(old.browser_id(), fresh.browser_id());

        assert_eq!(pool.close_dying_contexts().await, 1);
        assert!(old.is_closed());
        assert!(!drivers.is_browser_alive(&old.browser_id().unwrap()));
        assert!(drivers.is_browser_alive(&fresh.browser_id().unwrap()));
        assert!(fresh.is_active());
        fresh.run(&task, |_| async { Ok(()) }).await.unwrap();
        assert_eq!(launcher.launch_count(), 2);
        assert_disjoint(&pool);
    }

    #[tokio::test]
    async fn test_concurrent_distinct_agents_respect_bound() {
        let pool = Arc::new(PrivacyContextPool::new(4, Duration::ZERO));
        let drivers = drivers();

        let handles: Vec<_> = (0..50)
            .map(|i| {
                let pool = pool.clone();
                let drivers = drivers.clone();
                tokio::spawn(async move {
                    pool.get_or_create(&agent(&format!("cx.{i}")), |a| {
                        PrivacyContext::new(a.clone(), drivers, None, 8)
                    })
                })
            })
            .collect();

        let (mut admitted, mut saturated) = (0, 0);
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => admitted += 1,
                Err(PoolError::Saturated { allowed: 4, .. }) => saturated += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(admitted, 4);
        assert_eq!(saturated, 46);
        assert_eq!(pool.active_context_count(), 4);
        assert_disjoint(&pool);
    }
}
