// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::fs;

use crate::context::{TaskSnapshot, COMM_LENGTH};

/// Number of online CPUs.
pub fn cpu_count() -> usize {
    unsafe {
        let count = libc::sysconf(libc::_SC_NPROCESSORS_ONLN);

        if count < 1 {
            1
        } else {
            count as usize
        }
    }
}

/// CPU the calling thread is running on.
pub fn current_cpu() -> usize {
    unsafe {
        let cpu = libc::sched_getcpu();

        if cpu < 0 {
            0
        } else {
            cpu as usize
        }
    }
}

fn current_comm() -> [u8; COMM_LENGTH] {
    let mut comm = [0u8; COMM_LENGTH];

    if let Ok(name) = fs::read_to_string("/proc/self/comm") {
        let name = name.trim_end();
        let len = name.len().min(COMM_LENGTH - 1);

        comm[.. len].copy_from_slice(&name.as_bytes()[.. len]);
    }

    comm
}

fn ns_inum(
    name: &str) -> Option<u32> {
    let link = fs::read_link(format!("/proc/self/ns/{}", name)).ok()?;
    let link = link.to_str()?;

    /* Format: mnt:[4026531840] */
    let start = link.find('[')? + 1;
    let end = link.find(']')?;

    link[start .. end].parse().ok()
}

fn current_nice() -> i32 {
    unsafe {
        /* getpriority can legitimately return -1, so errno decides */
        *libc::__errno_location() = 0;

        let prio = libc::getpriority(libc::PRIO_PROCESS as _, 0);

        if prio == -1 && *libc::__errno_location() != 0 {
            0
        } else {
            prio
        }
    }
}

/// Snapshots the calling task's attributes for one event. The host
/// process sees its own pid namespace, so vpid and vtid are the ids as
/// this task observes them.
pub fn current_task() -> TaskSnapshot {
    let pid = unsafe { libc::getpid() };

    TaskSnapshot {
        pid,
        ppid: unsafe { libc::getppid() },
        vpid: pid,
        vtid: unsafe { libc::gettid() },
        nice: current_nice(),
        uid: unsafe { libc::getuid() },
        euid: unsafe { libc::geteuid() },
        comm: current_comm(),
        mnt_ns: ns_inum("mnt"),
        time_ns: ns_inum("time"),
    }
}
