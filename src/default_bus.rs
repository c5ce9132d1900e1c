//! The default bus of the current context.
//!
//! Every context sees the process-wide default connection unless it runs inside a
//! [scope] (or [scope_blocking]) that overrides it. Overrides are visible to the
//! scoped future and to tasks started with [spawn] from inside it, but not to other
//! tasks or threads.

use {
    crate::{
        address::BusKind,
        connection::{ConnectionBuilder, Mode},
        settings, Connection, Error,
    },
    arc_swap::ArcSwapOption,
    error_reporter::Report,
    std::{cell::RefCell, future::Future, sync::Arc},
    tokio::task::JoinHandle,
};

static PROCESS: ArcSwapOption<Connection> = ArcSwapOption::const_empty();
static PROCESS_BLOCKING: ArcSwapOption<Connection> = ArcSwapOption::const_empty();

tokio::task_local! {
    static SCOPE: RefCell<Option<Connection>>;
}

thread_local! {
    static BLOCKING_SCOPE: RefCell<Option<Option<Connection>>> = const { RefCell::new(None) };
}

fn task_override() -> Option<Connection> {
    SCOPE.try_with(|s| s.borrow().clone()).ok().flatten()
}

fn thread_override() -> Option<Connection> {
    BLOCKING_SCOPE.with(|s| s.borrow().clone().flatten())
}

fn live(slot: &ArcSwapOption<Connection>) -> Option<Connection> {
    slot.load_full()
        .filter(|c| !c.is_closed())
        .map(|c| (*c).clone())
}

/// Installs `conn` unless another task has installed a live connection first.
fn install(slot: &ArcSwapOption<Connection>, conn: Connection) -> Connection {
    let conn = Arc::new(conn);
    let prev = slot.rcu(|cur| match cur {
        Some(c) if !c.is_closed() => Some(c.clone()),
        _ => Some(conn.clone()),
    });
    match prev {
        Some(c) if !c.is_closed() => (*c).clone(),
        _ => (*conn).clone(),
    }
}

/// Returns the default bus of the current context without opening one.
pub fn current() -> Option<Connection> {
    task_override()
        .or_else(thread_override)
        .or_else(|| live(&PROCESS))
        .or_else(|| live(&PROCESS_BLOCKING))
}

/// Returns the cooperative default bus of the current context.
///
/// If no connection has been installed, a connection to the bus configured in the
/// settings is opened and installed as the process default.
pub async fn default_bus() -> Result<Connection, Error> {
    if let Some(conn) = task_override() {
        return Ok(conn);
    }
    if let Some(conn) = live(&PROCESS) {
        return Ok(conn);
    }
    let settings = settings::get();
    let conn = match ConnectionBuilder::bus(settings.default_bus).build().await {
        Ok(c) => c,
        Err(e) if settings.fallback_to_system && settings.default_bus == BusKind::Session => {
            log::warn!(
                "Could not connect to the session bus, using the system bus: {}",
                Report::new(&e)
            );
            ConnectionBuilder::system().build().await?
        }
        Err(e) => return Err(e),
    };
    Ok(install(&PROCESS, conn))
}

/// Returns the blocking default bus of the current thread.
pub fn default_bus_blocking() -> Result<Connection, Error> {
    if let Some(conn) = thread_override() {
        return Ok(conn);
    }
    if let Some(conn) = live(&PROCESS_BLOCKING) {
        return Ok(conn);
    }
    let settings = settings::get();
    let conn = match ConnectionBuilder::bus(settings.default_bus).build_blocking() {
        Ok(c) => c,
        Err(e) if settings.fallback_to_system && settings.default_bus == BusKind::Session => {
            log::warn!(
                "Could not connect to the session bus, using the system bus: {}",
                Report::new(&e)
            );
            ConnectionBuilder::system().build_blocking()?
        }
        Err(e) => return Err(e),
    };
    Ok(install(&PROCESS_BLOCKING, conn))
}

/// Overrides the default bus of the enclosing [scope] or [scope_blocking].
///
/// Fails with [Error::Misuse] outside of a scope. Use [set_process_default_bus] to
/// change the process-wide default.
pub fn set_default_bus(conn: &Connection) -> Result<(), Error> {
    if SCOPE
        .try_with(|s| *s.borrow_mut() = Some(conn.clone()))
        .is_ok()
    {
        return Ok(());
    }
    BLOCKING_SCOPE.with(|s| match &mut *s.borrow_mut() {
        Some(scoped) => {
            *scoped = Some(conn.clone());
            Ok(())
        }
        None => Err(Error::Misuse(
            "set_default_bus called outside of a default-bus scope".to_string(),
        )),
    })
}

/// Replaces the process-wide default bus for connections of the same mode.
pub fn set_process_default_bus(conn: &Connection) {
    let slot = match conn.mode() {
        Mode::Cooperative => &PROCESS,
        Mode::Blocking => &PROCESS_BLOCKING,
    };
    slot.store(Some(Arc::new(conn.clone())));
}

/// Runs `fut` with its own default bus.
///
/// The scope starts with `bus`, or with the default bus of the current context if
/// `bus` is `None`. Changes made with [set_default_bus] inside the scope are not
/// visible outside of it.
pub async fn scope<F: Future>(bus: Option<Connection>, fut: F) -> F::Output {
    let initial = bus.or_else(task_override);
    SCOPE.scope(RefCell::new(initial), fut).await
}

/// Spawns a task that inherits the default bus of the current context.
pub fn spawn<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let initial = task_override();
    tokio::spawn(SCOPE.scope(RefCell::new(initial), fut))
}

struct RestoreGuard(Option<Option<Connection>>);

impl Drop for RestoreGuard {
    fn drop(&mut self) {
        let prev = self.0.take();
        BLOCKING_SCOPE.with(|s| *s.borrow_mut() = prev);
    }
}

/// Runs `f` with its own default bus on the current thread.
///
/// The previous default is restored when `f` returns or unwinds.
pub fn scope_blocking<R>(bus: Option<Connection>, f: impl FnOnce() -> R) -> R {
    let prev = BLOCKING_SCOPE.with(|s| {
        let mut s = s.borrow_mut();
        let initial = bus.or_else(|| s.clone().flatten());
        s.replace(initial)
    });
    let _guard = RestoreGuard(prev);
    f()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocking_scopes_are_restored() {
        assert!(BLOCKING_SCOPE.with(|s| s.borrow().is_none()));
        scope_blocking(None, || {
            assert!(BLOCKING_SCOPE.with(|s| s.borrow().is_some()));
        });
        assert!(BLOCKING_SCOPE.with(|s| s.borrow().is_none()));
        let res = std::panic::catch_unwind(|| scope_blocking(None, || panic!()));
        assert!(res.is_err());
        assert!(BLOCKING_SCOPE.with(|s| s.borrow().is_none()));
    }
}
