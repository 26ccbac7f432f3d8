/// Sleeps for the given backoff duration and evaluates to the next one,
/// doubled and capped. Used by the blocking user-facing calls, which must
/// release all locks before invoking this.
macro_rules! backoff {
    ($delay:expr, $cap:expr) => {{
        ::std::thread::sleep($delay);
        ::std::cmp::min($delay * 2, $cap)
    }};
}
