use crate::config::IpPool;

/// Resolve a client-presented username to a pool address.
///
/// `username == base` maps to `pool[0]`. `username == base + N` (N a
/// positive decimal integer) maps to `pool[N-1]` when in range. Anything
/// else — empty username, empty pool, non-numeric suffix, zero/negative
/// index, out-of-range index — resolves to `None`, meaning "default
/// egress". Resolution failure never fails authentication; it only leaves
/// the session unbound.
pub fn resolve<'a>(username: &str, base: &str, pool: &'a IpPool) -> Option<&'a str> {
    if pool.is_empty() || username.is_empty() {
        return None;
    }
    if username == base {
        return pool.get(0);
    }
    let suffix = username.strip_prefix(base)?;
    let n: usize = suffix.parse().ok()?;
    if n == 0 {
        return None;
    }
    pool.get(n - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(n: usize) -> IpPool {
        let text = (0..n).map(|i| format!("2001:db8::{i}\n")).collect::<String>();
        IpPool::parse(&text)
    }

    #[test]
    fn deterministic() {
        let pool = pool(3);
        let a = resolve("user2", "user", &pool);
        let b = resolve("user2", "user", &pool);
        assert_eq!(a, b);
    }

    #[test]
    fn exact_base_maps_to_first() {
        let pool = pool(3);
        assert_eq!(resolve("user", "user", &pool), pool.get(0));
    }

    #[test]
    fn boundary_sweep() {
        let p = pool(5);
        for k in 1..=5usize {
            assert_eq!(resolve(&format!("user{k}"), "user", &p), p.get(k - 1));
        }
        assert_eq!(resolve("user6", "user", &p), None);
        assert_eq!(resolve("user0", "user", &p), None);
        assert_eq!(resolve("user-1", "user", &p), None);
    }

    #[test]
    fn non_numeric_suffix_is_none() {
        let p = pool(3);
        assert_eq!(resolve("userbob", "user", &p), None);
    }

    #[test]
    fn unrelated_username_is_none() {
        let p = pool(3);
        assert_eq!(resolve("anon", "user", &p), None);
        assert_eq!(resolve("other2", "user", &p), None);
    }

    #[test]
    fn empty_pool_or_username_is_none() {
        let empty = IpPool::default();
        assert_eq!(resolve("user1", "user", &empty), None);
        assert_eq!(resolve("", "user", &pool(3)), None);
    }
}
