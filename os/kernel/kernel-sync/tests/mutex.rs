use kernel_sync::{SpinMutex, SyncOnceCell, TicketMutex};
use std::panic;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn basic_lock_and_raii() {
    let l = SpinMutex::new(0_u32);

    // take the lock, mutate, and drop
    {
        let mut g = l.lock();
        *g = 41;
    }

    // lock again; previous drop must have unlocked
    {
        let mut g = l.lock();
        *g += 1;
        assert_eq!(*g, 42);
    }
}

#[test]
fn try_lock_semantics() {
    let l = TicketMutex::new(1u8);

    // first try_lock should succeed
    let g1 = l.try_lock();
    assert!(g1.is_some());
    assert_eq!(**g1.as_ref().unwrap(), 1);

    // while held, try_lock must fail
    let g2 = l.try_lock();
    assert!(g2.is_none());

    // dropping guard allows another try_lock
    drop(g1);
    let g3 = l.try_lock();
    assert!(g3.is_some());
}

#[test]
fn with_lock_works_and_unlocks() {
    let l = SpinMutex::new(String::from("a"));
    let len = l.with_lock(|s| {
        s.push('b');
        s.len()
    });
    assert_eq!(len, 2);

    // lock must be free now
    let got = l.with_lock(|s| s.clone());
    assert_eq!(got, "ab");
}

#[test]
fn get_mut_allows_direct_mutation() {
    let mut l = TicketMutex::new(vec![1, 2, 3]);
    // &mut self guarantees no contention; we should get a plain &mut T
    l.get_mut().push(4);
    assert_eq!(l.lock().as_slice(), &[1, 2, 3, 4]);
}

fn contended_increments_are_exact<L>(lock: Arc<L>, with: fn(&L, &dyn Fn(&mut usize)))
where
    L: Send + Sync + 'static,
{
    let threads = 8; // keep small for determinism
    let iters = 5_000; // likewise

    let in_cs = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let mut handles = Vec::with_capacity(threads);
    for _ in 0..threads {
        let lock = Arc::clone(&lock);
        let in_cs = Arc::clone(&in_cs);
        let start = Arc::clone(&start);
        handles.push(thread::spawn(move || {
            start.wait();
            for _ in 0..iters {
                with(&lock, &|v: &mut usize| {
                    let prev = in_cs.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(prev, 0, "mutual exclusion violated");
                    *v += 1;
                    in_cs.fetch_sub(1, Ordering::SeqCst);
                });

                // yield only AFTER releasing the lock to reduce convoy effects
                thread::yield_now();
            }
        }));
    }

    for h in handles {
        h.join().unwrap();
    }
}

#[test]
fn spin_contention_is_exclusive() {
    let lock = Arc::new(SpinMutex::new(0usize));
    contended_increments_are_exact(Arc::clone(&lock), |l, f| l.with_lock(|v| f(v)));
    assert_eq!(lock.with_lock(|v| *v), 8 * 5_000);
}

#[test]
fn ticket_contention_is_exclusive() {
    let lock = Arc::new(TicketMutex::new(0usize));
    contended_increments_are_exact(Arc::clone(&lock), |l, f| l.with_lock(|v| f(v)));
    assert_eq!(lock.with_lock(|v| *v), 8 * 5_000);
}

#[test]
fn lock_is_released_on_panic() {
    let l = SpinMutex::new(0u32);

    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        l.with_lock(|v| {
            *v = 123;
            panic!("boom");
        });
    }));
    assert!(res.is_err(), "expected panic");

    // We should be able to lock again right away.
    let val = l.with_lock(|v| *v);
    assert_eq!(val, 123);
}

#[test]
fn once_cell_set_then_get() {
    let c = SyncOnceCell::new();
    assert!(c.get().is_none());
    assert!(c.set(7u32).is_ok());
    assert_eq!(c.get(), Some(&7));
    // second set hands the value back
    assert_eq!(c.set(8), Err(8));
    assert_eq!(c.get(), Some(&7));
}

#[test]
fn once_cell_races_initialize_exactly_once() {
    let threads = 8;
    let cell = Arc::new(SyncOnceCell::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let mut handles = Vec::with_capacity(threads);
    for i in 0..threads {
        let cell = Arc::clone(&cell);
        let calls = Arc::clone(&calls);
        let start = Arc::clone(&start);
        handles.push(thread::spawn(move || {
            start.wait();
            *cell.get_or_init(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                i
            })
        }));
    }

    let mut winners: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    winners.dedup();
    assert_eq!(winners.len(), 1, "all threads must observe the same value");
    assert_eq!(calls.load(Ordering::SeqCst), 1, "init must run once");
}

#[test]
fn mutex_is_sync_for_send_t() {
    // If this compiles, the locks are Sync.
    fn takes_sync<S: Sync>(_s: &S) {}
    takes_sync(&SpinMutex::new(0u8));
    takes_sync(&TicketMutex::new(0u8));
    takes_sync(&SyncOnceCell::<u8>::new());
}
