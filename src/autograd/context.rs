//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::cell::RefCell;
use std::marker::PhantomData;

use smallvec::SmallVec;

//--------------------------------------------------------------------------------------------------

struct GradContext {
	enabled: bool,
	stack: SmallVec<[bool; 8]>,
}

impl GradContext {
	fn new() -> Self {
		Self { enabled: true, stack: SmallVec::new() }
	}

	fn push(&mut self) {
		self.stack.push(self.enabled);
		self.enabled = false;
	}

	/// Returns `false` and leaves the mode unchanged if the stack is empty.
	fn pop(&mut self) -> bool {
		let Some(prev) = self.stack.pop() else {
			return false;
		};
		self.enabled = prev;
		true
	}
}

thread_local! {
	static GRAD_CONTEXT: RefCell<GradContext> =
		RefCell::new(GradContext::new());
}

/// Whether operations currently record the computation graph.
pub fn is_grad_enabled() -> bool {
	GRAD_CONTEXT.with_borrow(|ctx| ctx.enabled)
}

/// Saves the current mode and disables graph construction.
///
/// Prefer `NoGradGuard`, which pairs this with `pop_no_grad()` on every exit path.
pub fn push_no_grad() {
	GRAD_CONTEXT.with_borrow_mut(GradContext::push);
}

/// Restores the mode saved by the matching `push_no_grad()`.
///
/// Popping an empty stack leaves the mode unchanged. It is always a caller bug.
pub fn pop_no_grad() {
	if !GRAD_CONTEXT.with_borrow_mut(GradContext::pop) {
		debug_assert!(false, "pop_no_grad() without matching push_no_grad()");
		log::warn!("pop_no_grad() without matching push_no_grad()");
	}
}

/// Current nesting depth of no-grad scopes.
pub fn no_grad_depth() -> usize {
	GRAD_CONTEXT.with_borrow(|ctx| ctx.stack.len())
}

//--------------------------------------------------------------------------------------------------

/// Disables graph construction until dropped.
///
/// Guards nest. Each one restores exactly the mode that was active when it was created.
#[must_use = "gradient tracking is re-enabled as soon as the guard is dropped"]
pub struct NoGradGuard {
	// the mode is thread local, so the guard must stay on its thread
	_not_send: PhantomData<*const ()>,
}

impl NoGradGuard {
	pub fn new() -> Self {
		push_no_grad();
		Self { _not_send: PhantomData }
	}
}

impl Default for NoGradGuard {
	fn default() -> Self {
		Self::new()
	}
}

impl Drop for NoGradGuard {
	fn drop(&mut self) {
		pop_no_grad();
	}
}

/// Runs `f` with graph construction disabled.
pub fn no_grad<R>(f: impl FnOnce() -> R) -> R {
	let _guard = NoGradGuard::new();
	f()
}

//--------------------------------------------------------------------------------------------------
