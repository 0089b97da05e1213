//! Multi-producer, single-consumer lock-free queue of intrusive nodes,
//! based on the 1024cores non-blocking MPSC design.
//!
//! Push is wait-free: one atomic exchange on the head plus a release store
//! linking the previous head. Pop may observe a producer that has exchanged
//! the head but not yet linked its node; it reports "empty for now" and the
//! producer's wakeup will bring the consumer back.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

/// Intrusive link. Embed as the **first** field of a `#[repr(C)]` owner so
/// node and owner addresses coincide.
#[repr(C)]
pub(crate) struct Node {
    next: AtomicPtr<Node>,
}

impl Node {
    pub(crate) fn new() -> Node {
        Node {
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

pub(crate) struct Queue {
    head: AtomicPtr<Node>,
    // Consumer-owned; never touched by producers.
    tail: AtomicPtr<Node>,
    // Boxed so the queue stays movable: head and tail point into the stub
    // allocation, not into the queue itself.
    stub: Box<Node>,
}

unsafe impl Send for Queue {}
unsafe impl Sync for Queue {}

impl Queue {
    pub(crate) fn new() -> Queue {
        let stub = Box::new(Node::new());
        let raw = &*stub as *const Node as *mut Node;
        Queue {
            head: AtomicPtr::new(raw),
            tail: AtomicPtr::new(raw),
            stub,
        }
    }

    fn stub(&self) -> *mut Node {
        &*self.stub as *const Node as *mut Node
    }

    /// Enqueue `node`. Safe to call from any thread; `node` must stay alive
    /// and untouched until popped.
    pub(crate) fn push(&self, node: *mut Node) {
        unsafe { (*node).next.store(ptr::null_mut(), Ordering::Relaxed) };

        let prev = self.head.swap(node, Ordering::AcqRel);

        // The release store makes the node's payload visible to a consumer
        // that observes the link.
        unsafe { (*prev).next.store(node, Ordering::Release) };
    }

    /// Dequeue one node, or null when the queue is empty *or* a producer is
    /// mid-push. Consumer thread only.
    pub(crate) unsafe fn pop(&self) -> *mut Node {
        let stub = self.stub();
        let mut tail = self.tail.load(Ordering::Relaxed);
        let mut next = (*tail).next.load(Ordering::Acquire);

        if tail == stub {
            if next.is_null() {
                return ptr::null_mut();
            }

            self.tail.store(next, Ordering::Relaxed);
            tail = next;
            next = (*next).next.load(Ordering::Acquire);
        }

        if !next.is_null() {
            self.tail.store(next, Ordering::Relaxed);
            return tail;
        }

        let head = self.head.load(Ordering::Acquire);
        if tail != head {
            // A producer has exchanged the head but not linked yet.
            return ptr::null_mut();
        }

        self.push(stub);

        next = (*tail).next.load(Ordering::Acquire);
        if !next.is_null() {
            self.tail.store(next, Ordering::Relaxed);
            return tail;
        }

        ptr::null_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::{Node, Queue};
    use std::sync::Arc;
    use std::thread;

    #[repr(C)]
    struct Item {
        node: Node,
        value: usize,
    }

    fn boxed(value: usize) -> *mut Item {
        Box::into_raw(Box::new(Item {
            node: Node::new(),
            value,
        }))
    }

    unsafe fn reclaim(item: *mut Item) -> usize {
        let item = Box::from_raw(item);
        item.value
    }

    #[test]
    fn fifo_single_thread() {
        let queue = Queue::new();
        assert!(unsafe { queue.pop() }.is_null());

        for value in 0..16 {
            queue.push(boxed(value) as *mut Node);
        }

        for expected in 0..16 {
            let node = unsafe { queue.pop() };
            assert!(!node.is_null());
            assert_eq!(unsafe { reclaim(node as *mut Item) }, expected);
        }

        assert!(unsafe { queue.pop() }.is_null());
    }

    #[test]
    fn producers_drain_completely() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 1_000;

        let queue = Arc::new(Queue::new());

        let handles: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        queue.push(boxed(p * PER_PRODUCER + i) as *mut Node);
                    }
                })
            })
            .collect();

        let mut seen = vec![false; PRODUCERS * PER_PRODUCER];
        let mut popped = 0;
        while popped < PRODUCERS * PER_PRODUCER {
            let node = unsafe { queue.pop() };
            if node.is_null() {
                thread::yield_now();
                continue;
            }
            let value = unsafe { reclaim(node as *mut Item) };
            assert!(!seen[value]);
            seen[value] = true;
            popped += 1;
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(unsafe { queue.pop() }.is_null());
    }

    #[test]
    fn per_producer_order_is_preserved() {
        const COUNT: usize = 2_000;

        let queue = Arc::new(Queue::new());
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for i in 0..COUNT {
                    queue.push(boxed(i) as *mut Node);
                }
            })
        };

        let mut last = None;
        let mut popped = 0;
        while popped < COUNT {
            let node = unsafe { queue.pop() };
            if node.is_null() {
                thread::yield_now();
                continue;
            }
            let value = unsafe { reclaim(node as *mut Item) };
            if let Some(last) = last {
                assert!(value > last);
            }
            last = Some(value);
            popped += 1;
        }

        producer.join().unwrap();
    }
}
