//! SQL for bulk node check-in updates, shared by both stores.
//!
//! One statement refreshes `last_seen` for a whole chunk of nodes, with
//! `CASE` arms for per-node addresses, byte counters and channel
//! timestamps.

use crate::models::NodeSeenUpdate;
use fleet_core::NodeChannel;
use time::OffsetDateTime;
use uuid::Uuid;

/// Nodes per statement. Keeps the bind count well under SQLite's limit.
pub(crate) const SEEN_CHUNK_SIZE: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Placeholder {
    /// `?` (SQLite)
    Question,
    /// `$1`, `$2`, … (PostgreSQL)
    Numbered,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SeenBind {
    Time(OffsetDateTime),
    Id(Uuid),
    Text(String),
    Int(i64),
}

#[derive(Debug)]
pub(crate) struct SeenUpdateSql {
    pub sql: String,
    pub binds: Vec<SeenBind>,
}

struct Builder {
    style: Placeholder,
    sql: String,
    binds: Vec<SeenBind>,
}

impl Builder {
    fn bind(&mut self, value: SeenBind) {
        self.binds.push(value);
        match self.style {
            Placeholder::Question => self.sql.push('?'),
            Placeholder::Numbered => {
                self.sql.push('$');
                self.sql.push_str(&self.binds.len().to_string());
            }
        }
    }

    fn bind_ids<'a>(&mut self, ids: impl Iterator<Item = &'a Uuid>) {
        for (i, id) in ids.enumerate() {
            if i > 0 {
                self.sql.push_str(", ");
            }
            self.bind(SeenBind::Id(*id));
        }
    }
}

/// Build the update for one chunk of coalesced check-ins.
pub(crate) fn seen_update_sql(
    updates: &[NodeSeenUpdate],
    seen_at: OffsetDateTime,
    style: Placeholder,
) -> SeenUpdateSql {
    let mut b = Builder {
        style,
        sql: String::from("UPDATE nodes SET last_seen = "),
        binds: Vec::new(),
    };
    b.bind(SeenBind::Time(seen_at));
    b.sql.push_str(", updated_at = ");
    b.bind(SeenBind::Time(seen_at));

    let with_ip: Vec<_> = updates
        .iter()
        .filter_map(|u| u.ip_address.as_ref().map(|ip| (u.node_id, ip)))
        .collect();
    if !with_ip.is_empty() {
        b.sql.push_str(", ip_address = CASE node_id");
        for (node_id, ip) in with_ip {
            b.sql.push_str(" WHEN ");
            b.bind(SeenBind::Id(node_id));
            b.sql.push_str(" THEN ");
            b.bind(SeenBind::Text(ip.clone()));
        }
        b.sql.push_str(" ELSE ip_address END");
    }

    let with_bytes: Vec<_> = updates.iter().filter(|u| u.bytes_received > 0).collect();
    if !with_bytes.is_empty() {
        b.sql.push_str(", bytes_received = bytes_received + CASE node_id");
        for update in with_bytes {
            b.sql.push_str(" WHEN ");
            b.bind(SeenBind::Id(update.node_id));
            b.sql.push_str(" THEN ");
            b.bind(SeenBind::Int(update.bytes_received));
        }
        b.sql.push_str(" ELSE 0 END");
    }

    for channel in NodeChannel::ALL {
        let members: Vec<&Uuid> = updates
            .iter()
            .filter(|u| u.channels.contains(channel))
            .map(|u| &u.node_id)
            .collect();
        if members.is_empty() {
            continue;
        }
        let column = channel.column();
        b.sql.push_str(&format!(", {column} = CASE WHEN node_id IN ("));
        b.bind_ids(members.into_iter());
        b.sql.push_str(") THEN ");
        b.bind(SeenBind::Time(seen_at));
        b.sql.push_str(&format!(" ELSE {column} END"));
    }

    b.sql.push_str(" WHERE node_id IN (");
    b.bind_ids(updates.iter().map(|u| &u.node_id));
    b.sql.push(')');

    SeenUpdateSql {
        sql: b.sql,
        binds: b.binds,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::ChannelSet;

    fn update(n: u128, ip: Option<&str>, channel: NodeChannel, bytes: i64) -> NodeSeenUpdate {
        NodeSeenUpdate {
            node_id: Uuid::from_u128(n),
            ip_address: ip.map(str::to_string),
            channels: ChannelSet::from(channel),
            bytes_received: bytes,
        }
    }

    #[test]
    fn test_minimal_update() {
        let now = OffsetDateTime::now_utc();
        let built = seen_update_sql(
            &[update(1, None, NodeChannel::Config, 0)],
            now,
            Placeholder::Question,
        );
        assert_eq!(
            built.sql,
            "UPDATE nodes SET last_seen = ?, updated_at = ?, \
             last_config = CASE WHEN node_id IN (?) THEN ? ELSE last_config END \
             WHERE node_id IN (?)"
        );
        assert_eq!(built.binds.len(), 5);
    }

    #[test]
    fn test_numbered_placeholders_match_binds() {
        let now = OffsetDateTime::now_utc();
        let updates = [
            update(1, Some("10.0.0.1"), NodeChannel::Log, 120),
            update(2, None, NodeChannel::QueryRead, 0),
            update(3, Some("10.0.0.3"), NodeChannel::Log, 0),
        ];
        let built = seen_update_sql(&updates, now, Placeholder::Numbered);
        let count = built.binds.len();
        assert!(built.sql.contains(&format!("${count})")));
        assert!(!built.sql.contains(&format!("${}", count + 1)));
        assert!(built.sql.contains("ip_address = CASE node_id WHEN $3 THEN $4"));
        assert!(built.sql.contains("ELSE ip_address END"));
        assert!(built.sql.contains("bytes_received = bytes_received + CASE node_id"));
        assert!(built.sql.contains("last_log = CASE WHEN node_id IN ("));
        assert!(built.sql.contains("last_query_read = CASE WHEN node_id IN ("));
        assert!(!built.sql.contains("last_carve"));
        assert_eq!(built.binds[3], SeenBind::Text("10.0.0.1".to_string()));
    }
}
