use ripple::reactor::{Fork, ReactorHandle};
use ripple::worker::Worker;
use ripple::RuntimeBuilder;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

struct Resettable {
    name: &'static str,
    log: Rc<RefCell<Vec<String>>>,
}

impl Worker for Resettable {
    fn name(&self) -> &str {
        self.name
    }

    fn after_fork(&mut self, _reactor: &ReactorHandle) {
        self.log.borrow_mut().push(format!("{}:after_fork", self.name));
    }
}

#[test]
fn test_fork_resets_child_and_supervises_it() {
    let dir = tempfile::tempdir().unwrap();
    let mut kernel = RuntimeBuilder::new()
        .runtime_dir(dir.path())
        .heartbeat_interval(Duration::from_millis(10))
        .build()
        .unwrap();

    let log = Rc::new(RefCell::new(Vec::new()));
    kernel.push(Resettable { name: "keep", log: log.clone() }).unwrap();
    kernel.push(Resettable { name: "skip", log: log.clone() }).unwrap();

    match kernel.fork(&["skip"]).unwrap() {
        Fork::Child => {
            let healthy = kernel.is_fork()
                && *log.borrow() == vec!["keep:after_fork".to_string()]
                && kernel.reactor().supervisor().children().is_empty();
            unsafe { libc::_exit(if healthy { 0 } else { 1 }) }
        }
        Fork::Parent(pid) => {
            assert!(pid > 0);
            assert!(!kernel.is_fork());
            assert!(log.borrow().is_empty(), "The parent keeps its workers untouched");
            assert_eq!(kernel.reactor().supervisor().children(), &[pid]);

            let reaped = kernel.reactor().supervisor().wait_all();
            assert_eq!(reaped.len(), 1);
            let (child, status) = reaped[0];
            assert_eq!(child, pid);
            assert!(libc::WIFEXITED(status), "Child should exit normally");
            assert_eq!(libc::WEXITSTATUS(status), 0, "Child checks should pass");
            assert!(kernel.reactor().supervisor().children().is_empty());
        }
    }
}
