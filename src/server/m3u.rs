//! M3U playlist generation
//!
//! One entry per enabled channel, referencing the same `.ts` URLs the
//! tuner lineup advertises. The `tvg-id` matches the XMLTV channel id (the
//! channel number string) so IPTV players can join playlist and guide.

use diesel::QueryResult;

use super::hdhr::enabled_channels;
use crate::db::DbPooledConnection;

/// Generate the playlist for all enabled channels
pub fn generate_m3u_playlist(
    conn: &mut DbPooledConnection,
    base_url: &str,
) -> QueryResult<String> {
    let channels = enabled_channels(conn)?;

    let mut playlist = String::with_capacity(128 + channels.len() * 160);
    playlist.push_str("#EXTM3U\n");

    for channel in channels {
        playlist.push_str(&format!(
            "#EXTINF:-1 tvg-id=\"{}\" tvg-chno=\"{}\" tvg-name=\"{}\"",
            channel.number, channel.number, channel.name
        ));
        if let Some(logo) = &channel.logo {
            if !logo.trim().is_empty() {
                playlist.push_str(&format!(" tvg-logo=\"{}\"", logo));
            }
        }
        if let Some(group) = &channel.group_name {
            if !group.trim().is_empty() {
                playlist.push_str(&format!(" group-title=\"{}\"", group));
            }
        }
        playlist.push(',');
        playlist.push_str(&channel.name);
        playlist.push('\n');
        playlist.push_str(&format!("{}/iptv/channel/{}.ts\n", base_url, channel.number));
    }

    Ok(playlist)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{run_migrations, DbConnection};
    use diesel::prelude::*;

    fn seeded_conn() -> (DbConnection, crate::db::DbPooledConnection) {
        let db = DbConnection::new(":memory:", 0).expect("pool");
        let mut conn = db.get_connection().expect("conn");
        run_migrations(&mut conn).expect("migrations");
        diesel::sql_query(
            "INSERT INTO channels (number, name, enabled, logo, group_name) VALUES
             ('7', 'Retro Movies', 1, 'http://host/logo.png', 'Movies'),
             ('1984.1', 'Docs', 1, NULL, NULL),
             ('9', 'Disabled One', 0, NULL, NULL)",
        )
        .execute(&mut conn)
        .unwrap();
        (db, conn)
    }

    #[test]
    fn test_playlist_lists_enabled_channels_only() {
        let (_db, mut conn) = seeded_conn();
        let playlist = generate_m3u_playlist(&mut conn, "http://10.0.0.2:5004").unwrap();

        assert!(playlist.starts_with("#EXTM3U\n"));
        assert!(playlist.contains("tvg-id=\"7\""));
        assert!(playlist.contains("http://10.0.0.2:5004/iptv/channel/7.ts"));
        assert!(playlist.contains("tvg-id=\"1984.1\""));
        assert!(!playlist.contains("Disabled One"));
    }

    #[test]
    fn test_playlist_carries_logo_and_group_when_present() {
        let (_db, mut conn) = seeded_conn();
        let playlist = generate_m3u_playlist(&mut conn, "http://10.0.0.2:5004").unwrap();

        assert!(playlist.contains("tvg-logo=\"http://host/logo.png\""));
        assert!(playlist.contains("group-title=\"Movies\""));
        // The channel without logo/group omits both attributes
        let docs_line = playlist
            .lines()
            .find(|l| l.contains("tvg-id=\"1984.1\""))
            .unwrap();
        assert!(!docs_line.contains("tvg-logo"));
        assert!(!docs_line.contains("group-title"));
    }

    #[test]
    fn test_playlist_entries_ordered_by_number() {
        let (_db, mut conn) = seeded_conn();
        let playlist = generate_m3u_playlist(&mut conn, "http://h").unwrap();
        let first = playlist.find("tvg-id=\"1984.1\"").unwrap();
        let second = playlist.find("tvg-id=\"7\"").unwrap();
        // Text ordering of number strings: "1984.1" sorts before "7"
        assert!(first < second);
    }
}
