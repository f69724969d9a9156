//! Exercises the real `self-kernel` service lock against simulated memory
//! and a virtual clock, so the 256-write acquisition dance and its
//! restore-on-drop release run in microseconds instead of a quarter second.

use self_harness::{SimEnvironment, SimKmp};
use self_kernel::service_lock::ServiceLock;

const LOCK_VA: u64 = 0x1000;

#[test]
fn acquire_then_drop_restores_the_original_word() {
    let kmp = SimKmp::new();
    kmp.seed_u64(LOCK_VA, 0xCAFE);
    let env = SimEnvironment::new();

    {
        let _guard = ServiceLock::acquire(&kmp, &env, LOCK_VA).expect("acquire");
        assert_eq!(kmp.peek_u64(LOCK_VA), 1, "lock word is held while the guard is alive");
    }

    assert_eq!(kmp.peek_u64(LOCK_VA), 0xCAFE, "drop restores the pre-acquisition word");
}

#[test]
fn acquisition_advances_the_virtual_clock_by_256ms() {
    let kmp = SimKmp::new();
    let env = SimEnvironment::new();

    let guard = ServiceLock::acquire(&kmp, &env, LOCK_VA).expect("acquire");
    assert_eq!(env.elapsed(), std::time::Duration::from_millis(256));
    drop(guard);
}
