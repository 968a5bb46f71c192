use super::{ComponentType, DefaultExpr, Globals};
use crate::record::{self, ConfigRecord};

pub(super) static ALL: [&ComponentType; 7] = [
    &COLLECTOR,
    &PROBE,
    &SANPROBE,
    &LICD,
    &WEBCONSOLE,
    &FILEAGENT,
    &HOST,
];

const fn expr(field: &'static str, template: &'static str) -> DefaultExpr {
    DefaultExpr { field, template }
}

/// Legacy keys every process-bearing type understands.
const PROCESS_LEGACY_KEYS: &[(&str, &str)] = &[
    ("PORT", record::PORT),
    ("LOGF", record::LOG_FILE),
    ("LOGD", record::LOG_DIR),
    ("BINS", record::INSTALL),
    ("BASE", record::VERSION),
    ("EXEC", record::PROGRAM),
    ("LIBS", record::LIBPATHS),
    ("USER", record::USER),
    ("OPTS", record::OPTIONS),
    ("HOME", record::HOME),
];

/// `NAME -port PORT`, then any extra options.
fn name_and_port(record: &ConfigRecord) -> Vec<String> {
    let mut args = vec![record.string(record::NAME)];
    if let Some(port) = record.port() {
        args.push("-port".to_string());
        args.push(port.to_string());
    }
    args
}

fn with_options(mut args: Vec<String>, record: &ConfigRecord) -> Vec<String> {
    args.extend(
        record
            .string(record::OPTIONS)
            .split_whitespace()
            .map(str::to_string),
    );
    args
}

/// Types that read a generated setup file.
fn setup_command(record: &ConfigRecord) -> Vec<String> {
    let mut args = name_and_port(record);
    args.push("-setup".to_string());
    args.push(record.string("Setup"));
    with_options(args, record)
}

fn plain_command(record: &ConfigRecord) -> Vec<String> {
    with_options(name_and_port(record), record)
}

fn licd_command(record: &ConfigRecord) -> Vec<String> {
    let mut args = name_and_port(record);
    args.push("-licence".to_string());
    args.push(record.string("Licence"));
    with_options(args, record)
}

fn no_command(_: &ConfigRecord) -> Vec<String> {
    Vec::new()
}

pub static COLLECTOR: ComponentType = ComponentType {
    tag: "collector",
    aliases: &["collector", "collectors"],
    related: &[],
    real: true,
    seeds: &[],
    defaults: &[
        expr(record::HOME, "{Root}/collector/collectors/{Name}"),
        expr(record::BINARY, "collector"),
        expr(record::INSTALL, "{Root}/packages/collector"),
        expr(record::VERSION, "active_prod"),
        expr(record::PROGRAM, "{Install}/{Version}/{Binary}"),
        expr(record::LIBPATHS, "{Install}/{Version}/lib64"),
        expr(record::LOG_FILE, "collector.txt"),
        expr("Setup", "{Home}/collector.setup.xml"),
    ],
    directories: &["packages/collector", "collector/collectors"],
    legacy_prefix: "COLL_",
    legacy_keys: PROCESS_LEGACY_KEYS,
    globals: Globals {
        port_range: "7039,7100-",
        clean: &["*.old", "*.core", "core.*"],
        purge: &["collector.txt", "*.snooze", "*.user_assignment", "*.cache"],
    },
    command: setup_command,
};

pub static PROBE: ComponentType = ComponentType {
    tag: "probe",
    aliases: &["probe", "probes"],
    related: &["sanprobe"],
    real: true,
    seeds: &[],
    defaults: &[
        expr(record::HOME, "{Root}/probe/probes/{Name}"),
        expr(record::BINARY, "probe"),
        expr(record::INSTALL, "{Root}/packages/probe"),
        expr(record::VERSION, "active_prod"),
        expr(record::PROGRAM, "{Install}/{Version}/{Binary}"),
        expr(record::LIBPATHS, "{Install}/{Version}/lib64"),
        expr(record::LOG_FILE, "probe.txt"),
    ],
    directories: &["packages/probe", "probe/probes"],
    legacy_prefix: "PROBE_",
    legacy_keys: PROCESS_LEGACY_KEYS,
    globals: Globals {
        port_range: "7036,7100-",
        clean: &["*.old", "*.core"],
        purge: &["probe.txt", "*.snooze", "*.user_assignment"],
    },
    command: plain_command,
};

pub static SANPROBE: ComponentType = ComponentType {
    tag: "sanprobe",
    aliases: &["sanprobe", "sanprobes", "san"],
    related: &[],
    real: true,
    seeds: &[("Flavour", "probe")],
    defaults: &[
        expr(record::HOME, "{Root}/sanprobe/sanprobes/{Name}"),
        expr(record::BINARY, "sanprobe"),
        expr(record::INSTALL, "{Root}/packages/{Flavour}"),
        expr(record::VERSION, "active_prod"),
        expr(record::PROGRAM, "{Install}/{Version}/{Binary}"),
        expr(record::LIBPATHS, "{Install}/{Version}/lib64"),
        expr(record::LOG_FILE, "sanprobe.txt"),
        expr("Setup", "{Home}/sanprobe.setup.xml"),
    ],
    directories: &["packages/probe", "sanprobe/sanprobes"],
    legacy_prefix: "SAN_",
    legacy_keys: PROCESS_LEGACY_KEYS,
    globals: Globals {
        port_range: "7036,7100-",
        clean: &["*.old", "*.core"],
        purge: &["sanprobe.txt", "*.snooze", "*.user_assignment", "sanprobe.setup.xml"],
    },
    command: setup_command,
};

pub static LICD: ComponentType = ComponentType {
    tag: "licd",
    aliases: &["licd", "licds"],
    related: &[],
    real: true,
    seeds: &[],
    defaults: &[
        expr(record::HOME, "{Root}/licd/licds/{Name}"),
        expr(record::BINARY, "licd"),
        expr(record::INSTALL, "{Root}/packages/licd"),
        expr(record::VERSION, "active_prod"),
        expr(record::PROGRAM, "{Install}/{Version}/{Binary}"),
        expr(record::LIBPATHS, "{Install}/{Version}/lib64"),
        expr(record::LOG_FILE, "licd.txt"),
        expr("Licence", "{Home}/licd.licence"),
    ],
    directories: &["packages/licd", "licd/licds"],
    legacy_prefix: "LICD_",
    legacy_keys: PROCESS_LEGACY_KEYS,
    globals: Globals {
        port_range: "7041,7100-",
        clean: &["*.old", "*.core"],
        purge: &["licd.txt", "licd.db"],
    },
    command: licd_command,
};

pub static WEBCONSOLE: ComponentType = ComponentType {
    tag: "webconsole",
    aliases: &["webconsole", "webconsoles", "web"],
    related: &[],
    real: true,
    seeds: &[],
    defaults: &[
        expr(record::HOME, "{Root}/webconsole/webconsoles/{Name}"),
        expr(record::BINARY, "webconsole"),
        expr(record::INSTALL, "{Root}/packages/webconsole"),
        expr(record::VERSION, "active_prod"),
        expr(record::PROGRAM, "{Install}/{Version}/{Binary}"),
        expr(record::LIBPATHS, "{Install}/{Version}/lib64"),
        expr(record::LOG_FILE, "webconsole.txt"),
    ],
    directories: &["packages/webconsole", "webconsole/webconsoles"],
    legacy_prefix: "WEB_",
    legacy_keys: PROCESS_LEGACY_KEYS,
    globals: Globals {
        port_range: "8080,8100-",
        clean: &["*.old", "webapps/*/work/*"],
        purge: &["webconsole.txt", "logs/*.log", "tmp/*"],
    },
    command: plain_command,
};

pub static FILEAGENT: ComponentType = ComponentType {
    tag: "fileagent",
    aliases: &["fileagent", "fileagents"],
    related: &[],
    real: true,
    seeds: &[],
    defaults: &[
        expr(record::HOME, "{Root}/fileagent/fileagents/{Name}"),
        expr(record::BINARY, "fileagent"),
        expr(record::INSTALL, "{Root}/packages/fileagent"),
        expr(record::VERSION, "active_prod"),
        expr(record::PROGRAM, "{Install}/{Version}/{Binary}"),
        expr(record::LIBPATHS, "{Install}/{Version}/lib64"),
        expr(record::LOG_FILE, "fileagent.txt"),
    ],
    directories: &["packages/fileagent", "fileagent/fileagents"],
    legacy_prefix: "FA_",
    legacy_keys: PROCESS_LEGACY_KEYS,
    globals: Globals {
        port_range: "7030,7100-",
        clean: &["*.old"],
        purge: &["fileagent.txt"],
    },
    command: plain_command,
};

pub static HOST: ComponentType = ComponentType {
    tag: "host",
    aliases: &["host", "hosts", "remote"],
    related: &[],
    real: false,
    seeds: &[],
    defaults: &[
        expr(record::HOME, "{Root}/host/hosts/{Name}"),
        expr(record::HOSTNAME, "{Name}"),
        expr(record::SSH_PORT, "22"),
        expr(record::USERNAME, "{User}"),
        expr(record::REMOTE_ROOT, "{Root}"),
    ],
    directories: &["host/hosts"],
    legacy_prefix: "",
    legacy_keys: &[
        ("HOSTNAME", record::HOSTNAME),
        ("PORT", record::SSH_PORT),
        ("USERNAME", record::USERNAME),
        ("ROOT", record::REMOTE_ROOT),
    ],
    globals: Globals {
        port_range: "",
        clean: &[],
        purge: &[],
    },
    command: no_command,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_real_type_puts_the_name_in_its_arguments() {
        let mut record = ConfigRecord::new();
        record.set(record::NAME, "p1");
        record.set(record::PORT, 7036_i64);
        record.set(record::OPTIONS, "-nopassword  -debug");
        for ct in ALL.iter().filter(|ct| ct.real) {
            let args = (ct.command)(&record);
            assert_eq!(args.first().map(String::as_str), Some("p1"), "{}", ct.tag);
            assert!(args.contains(&"7036".to_string()), "{}", ct.tag);
            assert!(args.ends_with(&["-nopassword".to_string(), "-debug".to_string()]));
        }
    }

    #[test]
    fn unset_port_is_left_off_the_command_line() {
        let mut record = ConfigRecord::new();
        record.set(record::NAME, "p1");
        assert_eq!(plain_command(&record), vec!["p1".to_string()]);
    }

    #[test]
    fn home_template_matches_instance_dir_layout() {
        for ct in ALL {
            let home = ct
                .defaults
                .iter()
                .find(|expr| expr.field == record::HOME)
                .expect("every type defaults Home");
            let expected = format!("{{Root}}/{0}/{0}s/{{Name}}", ct.tag);
            assert_eq!(home.template, expected);
        }
    }
}
