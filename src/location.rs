//! Location identifiers: `"<rank>::<procId>"`.
//!
//! `rank` indexes a physical node; `procId` names a worker on it. The first
//! worker of a node reuses the rank's decimal string, later workers get a
//! generated unique token. Parsing splits on the first `"::"`.

use uuid::Uuid;

/// Compose a location string.
pub fn loc_name(rank: u32, proc_id: &str) -> String {
    format!("{rank}::{proc_id}")
}

/// The default location of a node's first worker.
pub fn node_loc(rank: u32) -> String {
    loc_name(rank, &rank.to_string())
}

/// A location on `rank` with a freshly generated worker id.
pub fn fresh_loc(rank: u32) -> String {
    loc_name(rank, &gen_proc_id())
}

/// A unique worker token.
pub fn gen_proc_id() -> String {
    Uuid::new_v4().to_string()
}

/// Split a location into rank and procId.
pub fn split(loc: &str) -> Option<(u32, &str)> {
    let (rank, proc_id) = loc.split_once("::")?;
    Some((rank.parse().ok()?, proc_id))
}

pub fn rank_of(loc: &str) -> Option<u32> {
    split(loc).map(|(rank, _)| rank)
}

pub fn proc_of(loc: &str) -> Option<&str> {
    split(loc).map(|(_, proc_id)| proc_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let loc = loc_name(3, "abc");
        assert_eq!(split(&loc), Some((3, "abc")));
        assert_eq!(rank_of(&loc), Some(3));
        assert_eq!(proc_of(&loc), Some("abc"));
    }

    #[test]
    fn first_worker_uses_the_rank_string() {
        assert_eq!(node_loc(2), "2::2");
    }

    #[test]
    fn splits_on_the_first_separator() {
        assert_eq!(split("1::a::b"), Some((1, "a::b")));
    }

    #[test]
    fn malformed_locations_do_not_parse() {
        assert_eq!(split("nope"), None);
        assert_eq!(split("x::y"), None);
        assert_eq!(split("::y"), None);
    }

    #[test]
    fn fresh_locations_are_distinct() {
        assert_ne!(fresh_loc(0), fresh_loc(0));
    }
}
