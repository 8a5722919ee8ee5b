use crate::error::Error;
use crate::models::Migration;
use crate::sources::Source;

/// A source over assets compiled into the binary, typically via
/// `include_bytes!`.
///
/// ```
/// use morph::sources::EmbeddedSource;
///
/// let source = EmbeddedSource::new([
///     ("000001_create_users.up.sql", &b"CREATE TABLE users (id int);"[..]),
///     ("000001_create_users.down.sql", &b"DROP TABLE users;"[..]),
/// ])
/// .unwrap();
/// ```
pub struct EmbeddedSource {
    migrations: Vec<Migration>,
}

impl EmbeddedSource {
    pub fn new<'a>(
        assets: impl IntoIterator<Item = (&'a str, &'a [u8])>,
    ) -> Result<EmbeddedSource, Error> {
        let mut migrations = Vec::new();
        for (raw_name, bytes) in assets {
            migrations.push(Migration::from_file(raw_name, bytes.to_vec())?);
        }
        migrations.sort_by(|a, b| a.raw_name.cmp(&b.raw_name));
        Ok(EmbeddedSource { migrations })
    }
}

impl Source for EmbeddedSource {
    fn migrations(&self) -> Vec<Migration> {
        self.migrations.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_from_asset_pairs() {
        let source = EmbeddedSource::new([
            ("000002_b.up.sql", &b"CREATE TABLE b (id int);"[..]),
            ("000001_a.up.sql", &b"CREATE TABLE a (id int);"[..]),
        ])
        .unwrap();

        let migrations = source.migrations();
        assert_eq!(migrations[0].raw_name, "000001_a.up.sql");
        assert_eq!(migrations[1].raw_name, "000002_b.up.sql");
    }

    #[test]
    fn propagates_parse_failures() {
        assert!(EmbeddedSource::new([("garbage.sql", &b""[..])]).is_err());
    }
}
