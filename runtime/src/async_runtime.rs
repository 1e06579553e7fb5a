//! In-process implementation of the asynchronous runtime ABI.
//!
//! The async-to-LLVM lowering turns `async.execute` regions into coroutines
//! that call a fixed set of C functions (`mlirAsyncRuntime*`). This module
//! implements those functions on top of host threads: tokens and values are
//! reference counted completion objects, and coroutine resumption is handed
//! to the [`AsyncTaskRunner`] installed for the duration of a call.
//!
//! The runtime objects outlive the call that created them: compiled code
//! transfers one reference to the host when a token or value is returned, and
//! the host wrapper drops it when destroyed.

use std::cell::{RefCell, UnsafeCell};
use std::ffi::c_void;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

/// External work queue that runs tasks spawned by compiled kernels.
///
/// The core never creates threads on its own; callers install a runner for
/// the duration of each call (see [`AsyncRuntimeScope`]).
pub trait AsyncTaskRunner: Send + Sync {
    fn schedule(&self, task: Box<dyn FnOnce() + Send>);
}

/// Runs every task inline on the calling thread.
#[derive(Debug, Default)]
pub struct InlineTaskRunner;

impl AsyncTaskRunner for InlineTaskRunner {
    fn schedule(&self, task: Box<dyn FnOnce() + Send>) {
        task();
    }
}

/// Runs every task on a fresh thread.
#[derive(Debug, Default)]
pub struct ThreadTaskRunner;

impl AsyncTaskRunner for ThreadTaskRunner {
    fn schedule(&self, task: Box<dyn FnOnce() + Send>) {
        std::thread::spawn(task);
    }
}

thread_local! {
    static TASK_RUNNER: RefCell<Option<Arc<dyn AsyncTaskRunner>>> = const { RefCell::new(None) };
}

/// Installs a task runner for the current thread; restores the previous one
/// on drop. Scoped to one `execute` call.
pub struct AsyncRuntimeScope {
    previous: Option<Arc<dyn AsyncTaskRunner>>,
}

impl AsyncRuntimeScope {
    pub fn install(runner: Option<Arc<dyn AsyncTaskRunner>>) -> Self {
        let previous = TASK_RUNNER.with(|slot| slot.replace(runner));
        Self { previous }
    }
}

impl Drop for AsyncRuntimeScope {
    fn drop(&mut self) {
        TASK_RUNNER.with(|slot| {
            *slot.borrow_mut() = self.previous.take();
        });
    }
}

fn current_runner() -> Option<Arc<dyn AsyncTaskRunner>> {
    TASK_RUNNER.with(|slot| slot.borrow().clone())
}

fn schedule(task: Box<dyn FnOnce() + Send>) {
    match current_runner() {
        Some(runner) => runner.schedule(task),
        // No runner installed: degrade to inline execution.
        None => task(),
    }
}

// ---------------------------------------------------------------------------
// Reference counted runtime objects.
// ---------------------------------------------------------------------------

/// Common header of every runtime object. Must be the first field of each
/// `#[repr(C)]` object so `AddRef`/`DropRef` can operate on type erased
/// pointers.
#[repr(C)]
struct RefCount {
    count: AtomicI64,
    destroy: unsafe fn(*mut RefCount),
}

impl RefCount {
    fn new(destroy: unsafe fn(*mut RefCount)) -> Self {
        Self { count: AtomicI64::new(1), destroy }
    }
}

unsafe fn obj_add_ref(obj: *mut RefCount, count: i64) {
    unsafe { (*obj).count.fetch_add(count, Ordering::Relaxed) };
}

unsafe fn obj_drop_ref(obj: *mut RefCount, count: i64) {
    let previous = unsafe { (*obj).count.fetch_sub(count, Ordering::AcqRel) };
    debug_assert!(previous >= count, "async runtime object over-released");
    if previous == count {
        let destroy = unsafe { (*obj).destroy };
        unsafe { destroy(obj) };
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Pending,
    Available,
    Error,
}

struct Waiters {
    state: State,
    callbacks: Vec<Box<dyn FnOnce(bool) + Send>>,
}

/// Completion state shared by tokens and values.
struct Awaitable {
    sync: Mutex<Waiters>,
    cv: Condvar,
}

impl Awaitable {
    fn new() -> Self {
        Self { sync: Mutex::new(Waiters { state: State::Pending, callbacks: Vec::new() }), cv: Condvar::new() }
    }

    fn complete(&self, is_error: bool) {
        let callbacks = {
            let mut guard = self.sync.lock();
            debug_assert_eq!(guard.state, State::Pending, "async object completed twice");
            guard.state = if is_error { State::Error } else { State::Available };
            self.cv.notify_all();
            std::mem::take(&mut guard.callbacks)
        };
        for callback in callbacks {
            callback(is_error);
        }
    }

    fn is_error(&self) -> bool {
        self.sync.lock().state == State::Error
    }

    /// Block until completion; returns whether the object is in error state.
    fn await_blocking(&self) -> bool {
        let mut guard = self.sync.lock();
        while guard.state == State::Pending {
            self.cv.wait(&mut guard);
        }
        guard.state == State::Error
    }

    /// Run `callback` once the object completes (immediately if it already
    /// has).
    fn and_then(&self, callback: impl FnOnce(bool) + Send + 'static) {
        let mut guard = self.sync.lock();
        match guard.state {
            State::Pending => guard.callbacks.push(Box::new(callback)),
            state => {
                let is_error = state == State::Error;
                drop(guard);
                callback(is_error);
            }
        }
    }
}

/// Completion handle produced by compiled async regions.
#[repr(C)]
pub struct AsyncToken {
    refs: RefCount,
    awaitable: Awaitable,
}

/// Deferred value produced by compiled async regions. The storage is written
/// by compiled code before the value is emplaced.
#[repr(C)]
pub struct AsyncValue {
    refs: RefCount,
    awaitable: Awaitable,
    storage: UnsafeCell<Vec<u8>>,
}

// SAFETY: the storage is written single-threaded by the producing coroutine
// before `EmplaceValue` publishes it; consumers read only after awaiting.
unsafe impl Send for AsyncValue {}
unsafe impl Sync for AsyncValue {}

/// A group of tokens awaited together.
#[repr(C)]
pub struct AsyncGroup {
    refs: RefCount,
    sync: Mutex<GroupState>,
    cv: Condvar,
}

struct GroupState {
    pending: i64,
    errors: i64,
    rank: i64,
    callbacks: Vec<Box<dyn FnOnce(bool) + Send>>,
}

unsafe fn destroy_token(obj: *mut RefCount) {
    drop(unsafe { Box::from_raw(obj as *mut AsyncToken) });
}

unsafe fn destroy_value(obj: *mut RefCount) {
    drop(unsafe { Box::from_raw(obj as *mut AsyncValue) });
}

unsafe fn destroy_group(obj: *mut RefCount) {
    drop(unsafe { Box::from_raw(obj as *mut AsyncGroup) });
}

/// Raw pointer wrapper for moving runtime object pointers into completion
/// callbacks. The referenced objects are kept alive by explicit `AddRef`.
struct SendPtr<T>(*mut T);
unsafe impl<T> Send for SendPtr<T> {}

// ---------------------------------------------------------------------------
// C ABI surface registered with the execution engine.
// ---------------------------------------------------------------------------

/// Coroutine resume function provided by the compiled code.
pub type CoroResume = unsafe extern "C" fn(*mut c_void);

pub unsafe extern "C" fn create_token() -> *mut AsyncToken {
    Box::into_raw(Box::new(AsyncToken {
        refs: RefCount::new(destroy_token),
        awaitable: Awaitable::new(),
    }))
}

pub unsafe extern "C" fn emplace_token(token: *mut AsyncToken) {
    unsafe { &(*token).awaitable }.complete(false);
}

pub unsafe extern "C" fn set_token_error(token: *mut AsyncToken) {
    unsafe { &(*token).awaitable }.complete(true);
}

pub unsafe extern "C" fn is_token_error(token: *mut AsyncToken) -> bool {
    unsafe { &(*token).awaitable }.is_error()
}

pub unsafe extern "C" fn await_token(token: *mut AsyncToken) {
    unsafe { &(*token).awaitable }.await_blocking();
}

pub unsafe extern "C" fn create_value(size: i64) -> *mut AsyncValue {
    Box::into_raw(Box::new(AsyncValue {
        refs: RefCount::new(destroy_value),
        awaitable: Awaitable::new(),
        storage: UnsafeCell::new(vec![0u8; size.max(0) as usize]),
    }))
}

pub unsafe extern "C" fn get_value_storage(value: *mut AsyncValue) -> *mut c_void {
    unsafe { (*(*value).storage.get()).as_mut_ptr() as *mut c_void }
}

pub unsafe extern "C" fn emplace_value(value: *mut AsyncValue) {
    unsafe { &(*value).awaitable }.complete(false);
}

pub unsafe extern "C" fn set_value_error(value: *mut AsyncValue) {
    unsafe { &(*value).awaitable }.complete(true);
}

pub unsafe extern "C" fn is_value_error(value: *mut AsyncValue) -> bool {
    unsafe { &(*value).awaitable }.is_error()
}

pub unsafe extern "C" fn await_value(value: *mut AsyncValue) {
    unsafe { &(*value).awaitable }.await_blocking();
}

/// `size` is the number of tokens that will be added to the group.
pub unsafe extern "C" fn create_group(size: i64) -> *mut AsyncGroup {
    Box::into_raw(Box::new(AsyncGroup {
        refs: RefCount::new(destroy_group),
        sync: Mutex::new(GroupState { pending: size, errors: 0, rank: 0, callbacks: Vec::new() }),
        cv: Condvar::new(),
    }))
}

pub unsafe extern "C" fn add_token_to_group(token: *mut AsyncToken, group: *mut AsyncGroup) -> i64 {
    let rank = {
        let mut state = unsafe { &(*group).sync }.lock();
        state.rank += 1;
        state.rank
    };

    // Keep the group alive until the token completes.
    unsafe { obj_add_ref(group as *mut RefCount, 1) };
    let group_ptr = SendPtr(group);

    unsafe { &(*token).awaitable }.and_then(move |is_error| {
        let group = group_ptr;
        let callbacks = {
            let group_ref = unsafe { &*group.0 };
            let mut state = group_ref.sync.lock();
            state.pending -= 1;
            if is_error {
                state.errors += 1;
            }
            if state.pending == 0 {
                group_ref.cv.notify_all();
                std::mem::take(&mut state.callbacks)
            } else {
                Vec::new()
            }
        };
        let group_error = unsafe { (*group.0).sync.lock().errors > 0 };
        for callback in callbacks {
            callback(group_error);
        }
        unsafe { obj_drop_ref(group.0 as *mut RefCount, 1) };
    });

    rank
}

pub unsafe extern "C" fn is_group_error(group: *mut AsyncGroup) -> bool {
    unsafe { &(*group).sync }.lock().errors > 0
}

pub unsafe extern "C" fn await_all_in_group(group: *mut AsyncGroup) {
    let group = unsafe { &*group };
    let mut state = group.sync.lock();
    while state.pending > 0 {
        group.cv.wait(&mut state);
    }
}

pub unsafe extern "C" fn add_ref(obj: *mut c_void, count: i64) {
    unsafe { obj_add_ref(obj as *mut RefCount, count) };
}

pub unsafe extern "C" fn drop_ref(obj: *mut c_void, count: i64) {
    unsafe { obj_drop_ref(obj as *mut RefCount, count) };
}

fn resume_task(handle: *mut c_void, resume: CoroResume) -> Box<dyn FnOnce() + Send> {
    let handle = SendPtr(handle as *mut c_void);
    Box::new(move || unsafe { resume(handle.0) })
}

pub unsafe extern "C" fn execute(handle: *mut c_void, resume: CoroResume) {
    schedule(resume_task(handle, resume));
}

pub unsafe extern "C" fn await_token_and_execute(
    token: *mut AsyncToken,
    handle: *mut c_void,
    resume: CoroResume,
) {
    // Capture the caller's runner: completion may happen on another thread.
    let runner = current_runner();
    let task = resume_task(handle, resume);
    unsafe { &(*token).awaitable }.and_then(move |_| match runner {
        Some(runner) => runner.schedule(task),
        None => task(),
    });
}

pub unsafe extern "C" fn await_value_and_execute(
    value: *mut AsyncValue,
    handle: *mut c_void,
    resume: CoroResume,
) {
    let runner = current_runner();
    let task = resume_task(handle, resume);
    unsafe { &(*value).awaitable }.and_then(move |_| match runner {
        Some(runner) => runner.schedule(task),
        None => task(),
    });
}

pub unsafe extern "C" fn await_all_in_group_and_execute(
    group: *mut AsyncGroup,
    handle: *mut c_void,
    resume: CoroResume,
) {
    let runner = current_runner();
    let task = resume_task(handle, resume);
    let group_ref = unsafe { &*group };
    let mut state = group_ref.sync.lock();
    if state.pending == 0 {
        drop(state);
        match runner {
            Some(runner) => runner.schedule(task),
            None => task(),
        }
    } else {
        state.callbacks.push(Box::new(move |_| match runner {
            Some(runner) => runner.schedule(task),
            None => task(),
        }));
    }
}

/// The symbol bindings registered with the execution engine before lookup.
pub fn symbol_map() -> Vec<(&'static str, *mut ())> {
    macro_rules! sym {
        ($name:literal, $func:expr) => {
            ($name, $func as usize as *mut ())
        };
    }

    vec![
        sym!("mlirAsyncRuntimeAddRef", add_ref),
        sym!("mlirAsyncRuntimeDropRef", drop_ref),
        sym!("mlirAsyncRuntimeCreateToken", create_token),
        sym!("mlirAsyncRuntimeEmplaceToken", emplace_token),
        sym!("mlirAsyncRuntimeSetTokenError", set_token_error),
        sym!("mlirAsyncRuntimeIsTokenError", is_token_error),
        sym!("mlirAsyncRuntimeAwaitToken", await_token),
        sym!("mlirAsyncRuntimeCreateValue", create_value),
        sym!("mlirAsyncRuntimeGetValueStorage", get_value_storage),
        sym!("mlirAsyncRuntimeEmplaceValue", emplace_value),
        sym!("mlirAsyncRuntimeSetValueError", set_value_error),
        sym!("mlirAsyncRuntimeIsValueError", is_value_error),
        sym!("mlirAsyncRuntimeAwaitValue", await_value),
        sym!("mlirAsyncRuntimeCreateGroup", create_group),
        sym!("mlirAsyncRuntimeAddTokenToGroup", add_token_to_group),
        sym!("mlirAsyncRuntimeIsGroupError", is_group_error),
        sym!("mlirAsyncRuntimeAwaitAllInGroup", await_all_in_group),
        sym!("mlirAsyncRuntimeExecute", execute),
        sym!("mlirAsyncRuntimeAwaitTokenAndExecute", await_token_and_execute),
        sym!("mlirAsyncRuntimeAwaitValueAndExecute", await_value_and_execute),
        sym!("mlirAsyncRuntimeAwaitAllInGroupAndExecute", await_all_in_group_and_execute),
    ]
}

// ---------------------------------------------------------------------------
// Host side wrappers.
// ---------------------------------------------------------------------------

/// Host handle for a returned `!async.token`. Owns one reference.
pub struct AsyncTokenHandle {
    token: *mut AsyncToken,
}

unsafe impl Send for AsyncTokenHandle {}
unsafe impl Sync for AsyncTokenHandle {}

impl AsyncTokenHandle {
    /// Takes over the reference held by `token`.
    ///
    /// # Safety
    ///
    /// `token` must be a live runtime token whose reference is transferred to
    /// the handle.
    pub unsafe fn from_raw(token: *mut AsyncToken) -> Self {
        Self { token }
    }

    /// Block until the token completes.
    pub fn wait(&self) -> Result<()> {
        let is_error = unsafe { &(*self.token).awaitable }.await_blocking();
        if is_error { Err(Error::AsyncCompletion) } else { Ok(()) }
    }
}

impl Drop for AsyncTokenHandle {
    fn drop(&mut self) {
        unsafe { obj_drop_ref(self.token as *mut RefCount, 1) };
    }
}

impl std::fmt::Debug for AsyncTokenHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncTokenHandle").finish_non_exhaustive()
    }
}

/// Host handle for a returned `!async.value`. Owns one reference.
pub struct AsyncValueHandle {
    value: *mut AsyncValue,
}

unsafe impl Send for AsyncValueHandle {}
unsafe impl Sync for AsyncValueHandle {}

impl AsyncValueHandle {
    /// Takes over the reference held by `value`.
    ///
    /// # Safety
    ///
    /// `value` must be a live runtime value whose reference is transferred to
    /// the handle.
    pub unsafe fn from_raw(value: *mut AsyncValue) -> Self {
        Self { value }
    }

    /// Block until the value is available, then expose its storage.
    pub fn wait(&self) -> Result<*const u8> {
        let is_error = unsafe { &(*self.value).awaitable }.await_blocking();
        if is_error {
            Err(Error::AsyncCompletion)
        } else {
            Ok(unsafe { (*(*self.value).storage.get()).as_ptr() })
        }
    }
}

impl Drop for AsyncValueHandle {
    fn drop(&mut self) {
        unsafe { obj_drop_ref(self.value as *mut RefCount, 1) };
    }
}

impl std::fmt::Debug for AsyncValueHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncValueHandle").finish_non_exhaustive()
    }
}
