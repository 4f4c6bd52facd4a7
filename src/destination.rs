/*!
Resolving the destination a rotation bucket is written to.

A destination is a [`Template`] rendered with the current time (through a [`TimeFormat`]) and the process [`Identity`], then joined onto a root path.
*/

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::OnceLock,
};

use emit::{platform::rand_rng::RandRng, Rng as _};
use sha2::{Digest, Sha256};
use time::{format_description::OwnedFormatItem, OffsetDateTime, UtcOffset};

use crate::error::Error;

/**
The template used when none is given, or the given one fails to parse.
*/
pub const DEFAULT_TEMPLATE: &str = "rollout-{{Time}}.log";

/**
The time format used when none is given, or the given one fails to parse.
*/
pub const DEFAULT_TIME_FORMAT: &str = "[year]-[month]-[day]";

/**
A parsed destination name template.

Templates are plain text with placeholders wrapped in double braces:

- `{{Time}}`: the current time, rendered through a [`TimeFormat`].
- `{{Host}}`: a stable, hashed identifier for the current machine.
- `{{Pid}}`: the current process id.

Placeholders may also be written with a leading dot and surrounding whitespace, like `{{ .Time }}`.

When several processes write into the same directory, include `{{Pid}}` to keep them from writing over each other. When processes on different machines (or containers) share a directory, include `{{Host}}` as well.
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    parts: Vec<Part>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Text(String),
    Field(Field),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Time,
    Host,
    Pid,
}

impl Template {
    /**
    Parse a template, failing if a placeholder is unclosed or unknown.
    */
    pub fn parse(template: &str) -> Result<Self, Error> {
        let mut parts = Vec::new();
        let mut rest = template;

        while let Some(start) = rest.find("{{") {
            if start > 0 {
                parts.push(Part::Text(rest[..start].to_owned()));
            }

            let hole = &rest[start + 2..];
            let end = hole
                .find("}}")
                .ok_or_else(|| Error::new(format!("unclosed placeholder in `{template}`")))?;

            let name = hole[..end].trim();
            let name = name.strip_prefix('.').unwrap_or(name);

            let field = match name {
                "Time" => Field::Time,
                "Host" => Field::Host,
                "Pid" => Field::Pid,
                name => {
                    return Err(Error::new(format!(
                        "unknown placeholder `{name}` in `{template}`"
                    )))
                }
            };

            parts.push(Part::Field(field));
            rest = &hole[end + 2..];
        }

        if !rest.is_empty() {
            parts.push(Part::Text(rest.to_owned()));
        }

        Ok(Template { parts })
    }

    /**
    Render the template with a pre-formatted time and process identity.
    */
    pub fn render(&self, time: &str, identity: &Identity) -> String {
        let mut rendered = String::new();

        for part in &self.parts {
            match part {
                Part::Text(text) => rendered.push_str(text),
                Part::Field(Field::Time) => rendered.push_str(time),
                Part::Field(Field::Host) => rendered.push_str(identity.host()),
                Part::Field(Field::Pid) => rendered.push_str(&identity.pid().to_string()),
            }
        }

        rendered
    }
}

impl Default for Template {
    fn default() -> Self {
        Template {
            parts: vec![
                Part::Text("rollout-".to_owned()),
                Part::Field(Field::Time),
                Part::Text(".log".to_owned()),
            ],
        }
    }
}

/**
A parsed format for rendering the `{{Time}}` placeholder.

Formats use the [`time`] crate's format description syntax, like `[year]-[month]-[day]`.
*/
#[derive(Clone)]
pub struct TimeFormat {
    source: String,
    items: OwnedFormatItem,
}

impl TimeFormat {
    /**
    Parse a time format, failing if it's malformed or can't be used to render a timestamp.
    */
    pub fn parse(format: &str) -> Result<Self, Error> {
        let items = time::format_description::parse_owned::<1>(format).map_err(Error::new)?;

        // Some components, like week numbers with unusual reprs, only fail when used
        OffsetDateTime::UNIX_EPOCH
            .format(&items)
            .map_err(Error::new)?;

        Ok(TimeFormat {
            source: format.to_owned(),
            items,
        })
    }

    /**
    The format this value was parsed from.
    */
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /**
    Render `ts`, shifted to `offset`, using this format.

    If the timestamp can't be represented at the offset then it's rendered as an RFC3339 UTC timestamp instead.
    */
    pub fn format(&self, ts: emit::Timestamp, offset: UtcOffset) -> String {
        to_offset_date_time(ts, offset)
            .and_then(|local| local.format(&self.items).ok())
            .unwrap_or_else(|| format!("{:.0}", ts))
    }
}

impl Default for TimeFormat {
    fn default() -> Self {
        TimeFormat {
            source: DEFAULT_TIME_FORMAT.to_owned(),
            items: time::format_description::parse_owned::<1>(DEFAULT_TIME_FORMAT)
                .expect("the default time format is valid"),
        }
    }
}

impl fmt::Debug for TimeFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TimeFormat").field(&self.source).finish()
    }
}

impl PartialEq for TimeFormat {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

pub(crate) fn to_offset_date_time(ts: emit::Timestamp, offset: UtcOffset) -> Option<OffsetDateTime> {
    let utc = OffsetDateTime::from_unix_timestamp_nanos(ts.to_unix().as_nanos().try_into().ok()?)
        .ok()?;

    utc.checked_to_offset(offset)
}

/**
The identity of the running process, as substituted into `{{Host}}` and `{{Pid}}`.
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    host: String,
    pid: u32,
}

impl Identity {
    /**
    Create an identity from explicit values.
    */
    pub fn new(host: impl Into<String>, pid: u32) -> Self {
        Identity {
            host: host.into(),
            pid,
        }
    }

    /**
    The identity of the current process.

    The host identifier is the hex SHA-256 digest of the machine's hostname. If the hostname can't be read then random bytes are digested instead. The value is computed once and shared by all callers in the process.
    */
    pub fn current() -> Self {
        static CURRENT: OnceLock<Identity> = OnceLock::new();

        CURRENT
            .get_or_init(|| Identity::new(host_id(), std::process::id()))
            .clone()
    }

    /**
    The host identifier.
    */
    pub fn host(&self) -> &str {
        &self.host
    }

    /**
    The process id.
    */
    pub fn pid(&self) -> u32 {
        self.pid
    }
}

fn host_id() -> String {
    let mut hasher = Sha256::new();

    match hostname::get() {
        Ok(name) => hasher.update(name.to_string_lossy().as_bytes()),
        Err(_) => {
            let entropy = RandRng::new().fill([0; 256]).unwrap_or([0; 256]);

            hasher.update(entropy);
        }
    }

    hex::encode(hasher.finalize())
}

/**
Resolve the destination for `ts`.

The template is rendered with `ts` shifted to `offset` and formatted through `time_format`, then joined onto `root` using the platform's path rules. `root` isn't normalized in any other way.
*/
pub fn resolve(
    root: impl AsRef<Path>,
    template: &Template,
    ts: emit::Timestamp,
    offset: UtcOffset,
    time_format: &TimeFormat,
    identity: &Identity,
) -> PathBuf {
    let time = time_format.format(ts, offset);

    root.as_ref().join(template.render(&time, identity))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    fn ts(s: &str) -> emit::Timestamp {
        emit::Timestamp::try_from_str(s).unwrap()
    }

    fn identity() -> Identity {
        Identity::new("a1b2c3", 42)
    }

    #[test]
    fn template_parse() {
        for (template, expected) in [
            ("test-{{Time}}.log", "test-T.log"),
            ("{{Time}}", "T"),
            ("{{.Time}}.log", "T.log"),
            ("{{ .Host }}-{{ Pid }}.log", "a1b2c3-42.log"),
            ("{{Host}}/{{Pid}}/{{Time}}", "a1b2c3/42/T"),
            ("no-placeholders.log", "no-placeholders.log"),
            ("closing }} only", "closing }} only"),
            ("", ""),
        ] {
            let parsed = Template::parse(template).unwrap();

            assert_eq!(expected, parsed.render("T", &identity()), "{template}");
        }
    }

    #[test]
    fn template_parse_invalid() {
        for template in ["{{Time", "test-{{Unknown}}.log", "{{}}", "{{Time}}-{{"] {
            assert!(Template::parse(template).is_err(), "{template}");
        }
    }

    #[test]
    fn template_default() {
        assert_eq!(Template::parse(DEFAULT_TEMPLATE).unwrap(), Template::default());
    }

    #[test]
    fn time_format_parse_invalid() {
        assert!(TimeFormat::parse("[year").is_err());
        assert!(TimeFormat::parse("[not_a_component]").is_err());
    }

    #[test]
    fn time_format_default() {
        assert_eq!(
            TimeFormat::parse(DEFAULT_TIME_FORMAT).unwrap(),
            TimeFormat::default()
        );
        assert_eq!(
            "1970-01-01",
            TimeFormat::default().format(emit::Timestamp::MIN, UtcOffset::UTC)
        );
    }

    #[test]
    fn time_format_applies_offset() {
        let format = TimeFormat::parse("[year]-[month]-[day] [hour]:[minute]").unwrap();
        let ts = ts("2017-11-21T23:30:00Z");

        assert_eq!("2017-11-21 23:30", format.format(ts, UtcOffset::UTC));
        assert_eq!(
            "2017-11-22 07:30",
            format.format(ts, UtcOffset::from_hms(8, 0, 0).unwrap())
        );
        assert_eq!(
            "2017-11-21 18:30",
            format.format(ts, UtcOffset::from_hms(-5, 0, 0).unwrap())
        );
    }

    #[test]
    fn resolve_destination() {
        for (root, template, format, ts, expected) in [
            (
                "",
                "test-{{Time}}.log",
                "[year]-[month]-[day]",
                emit::Timestamp::MIN,
                "test-1970-01-01.log",
            ),
            (
                "/var/log",
                "{{Time}}.log",
                "[year]-[month]-[day]",
                emit::Timestamp::MIN,
                "/var/log/1970-01-01.log",
            ),
            (
                "/var/log",
                "test-{{Time}}.log",
                "[year]-[month]-[day]",
                ts("2017-11-11T14:15:00Z"),
                "/var/log/test-2017-11-11.log",
            ),
            (
                "",
                "test-{{Time}}.log",
                "[year]-[month]-[day] [hour]:[minute]",
                ts("2017-11-11T14:15:00Z"),
                "test-2017-11-11 14:15.log",
            ),
            (
                "logs",
                "{{Host}}-{{Pid}}-{{Time}}.log",
                "[year][month][day]",
                ts("2017-11-11T14:15:00Z"),
                "logs/a1b2c3-42-20171111.log",
            ),
        ] {
            let actual = resolve(
                root,
                &Template::parse(template).unwrap(),
                ts,
                UtcOffset::UTC,
                &TimeFormat::parse(format).unwrap(),
                &identity(),
            );

            assert_eq!(PathBuf::from(expected), actual);
        }
    }

    #[test]
    fn resolve_destination_local_midnight() {
        // Local midnight at UTC+8 is 16:00 UTC the previous day
        let offset = UtcOffset::from_hms(8, 0, 0).unwrap();
        let ts = emit::Timestamp::from_unix(Duration::from_secs(17492 * 86400 - 8 * 3600)).unwrap();

        let actual = resolve(
            "",
            &Template::parse("test-{{Time}}.log").unwrap(),
            ts,
            offset,
            &TimeFormat::default(),
            &identity(),
        );

        assert_eq!(PathBuf::from("test-2017-11-22.log"), actual);
    }

    #[test]
    fn current_identity_is_stable() {
        let a = Identity::current();
        let b = Identity::current();

        assert_eq!(a, b);
        assert_eq!(64, a.host().len());
        assert!(a.host().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(std::process::id(), a.pid());
    }
}
