// No tracing subscriber here: these chains are long enough that trace
// output would dominate the run time.
#[cfg(test)]
mod tests {
    use deferred::{join_void, Dispatch, Promise};
    use futures::executor::block_on;

    const DEPTH: u64 = 100_000;

    fn countdown(n: u64, queue: Dispatch) -> Promise<u64> {
        if n == 0 {
            return Promise::resolved(0);
        }
        let next = queue.clone();
        Promise::resolved(n).flat_map(move |n| countdown(n - 1, next), &queue)
    }

    #[test]
    fn test_recursive_flat_map() {
        let queue = Dispatch::serial("test_recursive_flat_map").unwrap();
        let result = countdown(DEPTH, queue);
        assert_eq!(block_on(result.settled()).unwrap(), 0);
    }

    #[test]
    fn test_long_fulfil_chain() {
        let head = Promise::<i32>::new();
        let mut tail = head.clone();
        for _ in 0..DEPTH {
            let next = Promise::new();
            tail.fulfill(next.clone());
            tail = next;
        }
        assert!(!head.is_settled());
        tail.resolve(7);
        assert_eq!(head.result().map(|result| result.ok()), Some(Some(7)));
    }

    #[test]
    fn test_long_join_chain() {
        let source = Promise::<()>::new();
        let mut tail = source.clone();
        for _ in 0..DEPTH {
            tail = join_void([tail]);
        }
        source.resolve(());
        assert!(tail.is_settled());
        assert!(block_on(tail.settled()).is_ok());
    }

    #[test]
    fn test_long_fulfil_chain_cancel() {
        let head = Promise::<i32>::new();
        let mut tail = head.clone();
        for _ in 0..DEPTH {
            let next = Promise::new();
            tail.fulfill(next.clone());
            tail = next;
        }
        head.cancel();
        assert!(tail.is_cancelled());
    }
}
