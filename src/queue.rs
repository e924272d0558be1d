// src/queue.rs

//! Sequential composite task
//!
//! A [`QueueTask`] owns an ordered list of child tasks and runs them one at
//! a time inside its own body, reporting aggregate progress as
//! children-completed over children-total (plus one optical unit so a
//! progress bar shows motion immediately). Cancelling the composite stops
//! the pop loop and forwards cancellation to the currently active child;
//! children that never started are never dequeued and keep their `Created`
//! state.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::task::{Task, TaskBuilder, TaskHandle};

pub struct QueueTask {
    name: String,
    children: Vec<Task>,
}

impl QueueTask {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            children: Vec::new(),
        }
    }

    /// Appends a child to the end of the run order.
    pub fn push(&mut self, task: Task) {
        self.children.push(task);
    }

    /// Builder-style [`push`](Self::push).
    pub fn with(mut self, task: Task) -> Self {
        self.push(task);
        self
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Converts the composite into a regular [`Task`], submittable to any
    /// pool like a single unit of work.
    pub fn into_task(self) -> Task {
        let total = self.children.len() as u64;
        let children = self.children;

        // Slot holding the currently running child, shared between the body
        // and the cancel hook. Read-then-cancel: the child may finish and
        // clear the slot concurrently, and cancelling a finished task is a
        // no-op.
        let active_child: Arc<Mutex<Option<Arc<TaskHandle>>>> = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&active_child);

        let task = TaskBuilder::new(self.name)
            .work_units(total + 1)
            .build(move |ctx| async move {
                ctx.publish_state(format!("0/{}", total), 1);

                let mut completed = 0u64;
                for child in children {
                    if ctx.is_cancelled() {
                        break;
                    }

                    let child_handle = child.handle();
                    *slot.lock() = Some(Arc::clone(&child_handle));
                    // A cancel may have slipped in before the slot was
                    // populated; the hook saw an empty slot, so forward here.
                    if ctx.is_cancelled() {
                        child_handle.cancel();
                    }

                    child.run(ctx.activity()).await;
                    *slot.lock() = None;

                    completed += 1;
                    ctx.publish_state(format!("{}/{}", completed, total), completed + 1);
                }

                Ok(())
            });

        let hook_slot = Arc::clone(&active_child);
        task.handle().set_cancel_hook(Box::new(move || {
            let child = hook_slot.lock().clone();
            if let Some(child) = child {
                child.cancel();
            }
        }));

        task
    }
}
