//! Convenience macros for defining migration sources.

/// Builds an in-memory [`MemorySource`](crate::sources::MemorySource) from
/// inline SQL, for code-first setups and tests that do not want a migrations
/// directory on disk.
///
/// Each entry maps a migration filename to its script body; the filename
/// must follow the usual `<version>_<name>.(up|down).<ext>` convention.
///
/// ```
/// use morph::sources::Source;
///
/// let source = morph::inline_migrations![
///     "000001_create_users.up.sql" => b"CREATE TABLE users (id integer primary key);",
///     "000001_create_users.down.sql" => b"DROP TABLE users;",
/// ];
/// assert_eq!(source.migrations().len(), 2);
/// ```
///
/// # Panics
///
/// Panics if a filename does not parse; migration names are developer input,
/// not runtime data.
#[macro_export]
macro_rules! inline_migrations {
    ($($raw:literal => $body:expr),* $(,)?) => {{
        let mut migrations = Vec::new();
        $(
            let body: &[u8] = $body;
            migrations.push(
                $crate::Migration::from_file($raw, body.to_vec())
                    .expect("invalid migration filename"),
            );
        )*
        $crate::sources::MemorySource::new(migrations)
    }};
}
