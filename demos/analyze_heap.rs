use anyhow;
use base64;
use chrono;
use chrono::offset::TimeZone;
use clap;
use csv;
use env_logger;
use memmap;

use hprof_snapshot::{Hprof, Id, ParseError, ProguardMap, RecordTag, Snapshot};
use itertools::Itertools;
use std::{collections, fs, io};

fn main() -> Result<(), anyhow::Error> {
    env_logger::init();

    let app = clap::App::new("Analyze heap")
        .arg(
            clap::Arg::with_name("file")
                .short("f")
                .long("file")
                .required(true)
                .takes_value(true)
                .help("Heap dump file to read"),
        )
        .arg(
            clap::Arg::with_name("mapping")
                .short("m")
                .long("mapping")
                .required(false)
                .takes_value(true)
                .help("ProGuard mapping file used to restore obfuscated names"),
        )
        .subcommand(clap::SubCommand::with_name("header")
            .about("Display metadata from the hprof header"))
        .subcommand(clap::SubCommand::with_name("record-counts")
            .about("Display the number of each of the top level hprof record types"))
        .subcommand(clap::SubCommand::with_name("dump-strings")
            .about("Display string records as CSV"))
        .subcommand(
            clap::SubCommand::with_name("top-retained")
                .about("Display the instances retaining the most memory as CSV")
                .arg(
                    clap::Arg::with_name("count")
                        .short("n")
                        .long("count")
                        .help("how many instances to list")
                        .default_value("20")
                        .takes_value(true),
                ),
        )
        .subcommand(
            clap::SubCommand::with_name("site-objects")
                .about("Display per-class totals for each allocation site as CSV")
                .arg(
                    clap::Arg::with_name("class")
                        .short("c")
                        .long("class")
                        .help("only count instances of exactly this class")
                        .takes_value(true),
                ),
        )
        .subcommand(
            clap::SubCommand::with_name("gc-root-path")
                .about("Display the shortest path from a gc root to an instance")
                .arg(
                    clap::Arg::with_name("id")
                        .long("id")
                        .help("object id, in hex")
                        .required(true)
                        .takes_value(true),
                ),
        );
    let matches = app.get_matches();

    let file_path = matches
        .value_of("file")
        .ok_or_else(|| anyhow::anyhow!("file must be specified"))?;
    let file = fs::File::open(file_path)?;
    let memmap = unsafe { memmap::MmapOptions::new().map(&file) }?;

    match matches.subcommand() {
        ("header", _) => header(&hprof_snapshot::parse_hprof(&memmap[..])?)?,
        ("record-counts", _) => record_counts(&hprof_snapshot::parse_hprof(&memmap[..])?)?,
        ("dump-strings", _) => dump_strings(&hprof_snapshot::parse_hprof(&memmap[..])?)?,
        ("", _) => return Err(anyhow::anyhow!("No subcommand given, see --help")),
        (name, arg_matches) => {
            let mut builder = Snapshot::builder();
            if let Some(path) = matches.value_of("mapping") {
                builder = builder.proguard_map(ProguardMap::from_file(path)?);
            }
            let snapshot = builder.build(&memmap[..])?;
            let arg_matches = arg_matches.ok_or_else(|| anyhow::anyhow!("must provide args"))?;

            match name {
                "top-retained" => {
                    let count = arg_matches
                        .value_of("count")
                        .map(|s| s.parse::<usize>())
                        .transpose()?
                        .unwrap_or(20);
                    top_retained(&snapshot, count)?
                }
                "site-objects" => site_objects(&snapshot, arg_matches.value_of("class"))?,
                "gc-root-path" => {
                    let id = arg_matches
                        .value_of("id")
                        .ok_or_else(|| anyhow::anyhow!("must provide an id"))?;
                    let id = u64::from_str_radix(id.trim_start_matches("0x"), 16)?;
                    gc_root_path(&snapshot, Id::from(id))?
                }
                _ => return Err(anyhow::anyhow!("Unknown subcommand {:?}", name)),
            }
        }
    };

    Ok(())
}

fn header(hprof: &Hprof) -> Result<(), anyhow::Error> {
    println!("Label: {}", hprof.header().label()?);
    println!("Id size: {:?}", hprof.header().id_size());
    let ts = chrono::Utc.timestamp_millis(hprof.header().timestamp_millis() as i64);
    println!("Timestamp: {}", ts);

    Ok(())
}

fn record_counts(hprof: &Hprof) -> Result<(), anyhow::Error> {
    let mut counts = collections::HashMap::<RecordTag, u64>::new();
    for r in hprof.records_iter() {
        *counts.entry(r?.tag()).or_insert(0) += 1;
    }

    // highest count on top
    for (tag, count) in counts
        .into_iter()
        .sorted_by_key(|&(_, count)| std::cmp::Reverse(count))
    {
        println!("{:?}: {}", tag, count);
    }

    Ok(())
}

fn dump_strings(hprof: &Hprof) -> Result<(), anyhow::Error> {
    let mut wtr = csv::Writer::from_writer(io::stdout());
    wtr.write_record(&[
        "Name id",
        "Contents (valid utf8)",
        "Error (if invalid utf-8)",
        "Contents (base64 of invalid utf8)",
    ])?;

    for r in hprof.records_iter() {
        let r = r?;
        let u = match r.as_utf_8() {
            Some(u) => u.map_err(|e| ParseError::from_nom(e, hprof.buffer(), "string"))?,
            None => continue,
        };

        match u.text_as_str() {
            Ok(s) => wtr.write_record(&[
                format!("{}", u.name_id()),
                s.to_string(),
                String::new(),
                String::new(),
            ]),
            Err(e) => wtr.write_record(&[
                format!("{}", u.name_id()),
                String::new(),
                format!("{:?}", e),
                base64::encode(u.text()),
            ]),
        }?;
    }

    wtr.flush()?;
    Ok(())
}

fn top_retained(snapshot: &Snapshot, count: usize) -> Result<(), anyhow::Error> {
    let mut wtr = csv::Writer::from_writer(io::stdout());
    wtr.write_record(&[
        "Id",
        "Class",
        "Heap",
        "Shallow java",
        "Shallow external",
        "Retained java",
        "Retained external",
    ])?;

    for i in snapshot
        .instances()
        .sorted_by_key(|i| std::cmp::Reverse(i.retained_size().total()))
        .take(count)
    {
        let shallow = i.size();
        let retained = i.retained_size();
        wtr.write_record(&[
            format!("{:#x}", i.id()),
            i.to_string(),
            i.heap_name().to_string(),
            shallow.java.to_string(),
            shallow.external.to_string(),
            retained.java.to_string(),
            retained.external.to_string(),
        ])?;
    }

    let unreachable = snapshot.unreachable_stats();
    log::info!(
        "Total retained {}, {} unreachable instances ({})",
        snapshot.total_retained(),
        unreachable.count,
        unreachable.size
    );

    wtr.flush()?;
    Ok(())
}

fn site_objects(snapshot: &Snapshot, class: Option<&str>) -> Result<(), anyhow::Error> {
    let mut wtr = csv::Writer::from_writer(io::stdout());
    wtr.write_record(&["Site", "Heap", "Class", "Instances", "Bytes"])?;

    let mut stack = vec![(snapshot.root_site(), String::from("ROOT"))];
    while let Some((site, path)) = stack.pop() {
        for info in site.objects_infos() {
            let class_name = info
                .class
                .and_then(|c| c.class_obj_name())
                .unwrap_or("(unknown)");
            if class.map_or(false, |c| c != class_name) {
                continue;
            }

            wtr.write_record(&[
                path.clone(),
                info.heap.to_string(),
                class_name.to_string(),
                info.num_instances.to_string(),
                info.num_bytes.total().to_string(),
            ])?;
        }

        let children = site.children().collect_vec();
        for child in children.into_iter().rev() {
            let child_path = format!("{} > {}", path, child.name());
            stack.push((child, child_path));
        }
    }

    wtr.flush()?;
    Ok(())
}

fn gc_root_path(snapshot: &Snapshot, id: Id) -> Result<(), anyhow::Error> {
    let instance = snapshot
        .find_instance(id)
        .ok_or_else(|| anyhow::anyhow!("No reachable instance with id {:#x}", id))?;

    for element in instance.path_from_gc_root() {
        let roots = element
            .instance
            .root_types()
            .iter()
            .map(|t| t.to_string())
            .join(", ");
        println!(
            "{}{}{}",
            if element.is_dominator { "* " } else { "  " },
            element.instance,
            if roots.is_empty() {
                String::new()
            } else {
                format!(" (root: {})", roots)
            }
        );
        if !element.field.is_empty() {
            println!("      {}", element.field);
        }
    }

    println!("Retained: {}", instance.retained_size());
    Ok(())
}
