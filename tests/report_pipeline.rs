// End to end: seed the store, record entries, build reports from the store

use chrono::NaiveDate;
use facility_kpis::{
    load_catalog, load_units, open_month, query_entries, save_reference_data, setup_database,
    unit_report, upsert_entry, upsert_entry_value, ContentBlock, EntryFilter, KpiEntry, Period,
    ReferenceData,
};
use rusqlite::Connection;

fn month(y: i32, m: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, 1).unwrap()
}

fn seeded() -> Connection {
    let mut conn = Connection::open_in_memory().unwrap();
    setup_database(&conn).unwrap();

    let data: ReferenceData = serde_json::from_value(serde_json::json!({
        "units": [
            {"id": 1, "name": "Experimental Facilities", "acronym": "EFD",
             "kind": {"id": 1, "name": "Division", "reporter": false}, "parent": null},
            {"id": 2, "name": "Canadian Macromolecular Crystallography Facility", "acronym": "CMCF",
             "kind": {"id": 2, "name": "Beamline", "reporter": true}, "parent": 1},
            {"id": 3, "name": "Hard X-ray Micro-Analysis", "acronym": "HXMA",
             "kind": {"id": 2, "name": "Beamline", "reporter": true}, "parent": 1}
        ],
        "categories": [
            {"id": 1, "name": "Operations", "description": "Deliver reliable beam", "priority": 0}
        ],
        "kpis": [
            {"id": 8, "name": "Normal Shifts", "category": 1, "kind": "SUM", "priority": 0, "units": [1]},
            {"id": 9, "name": "Shifts Used", "category": 1, "kind": "SUM", "priority": 1, "units": [1]},
            {"id": 7, "name": "Availability", "category": 1, "kind": "AVERAGE", "priority": 2, "units": [1]},
            {"id": 20, "name": "Highlights", "category": null, "kind": "TEXT", "units": [1]}
        ],
        "families": [
            {"id": 1, "name": "Beam Time", "kind": "RELATED", "kpis": [8, 9]}
        ]
    }))
    .unwrap();

    save_reference_data(&mut conn, &data).unwrap();
    conn
}

#[test]
fn test_division_report_from_store() {
    let conn = seeded();
    let tree = load_units(&conn).unwrap();
    let catalog = load_catalog(&conn).unwrap();

    // Each beamline opens January and February
    for unit in [2, 3] {
        for m in [1, 2] {
            assert_eq!(open_month(&conn, &catalog, &tree, unit, month(2024, m), "owner").unwrap(), 4);
        }
    }

    for (unit, m, used, availability) in [(2, 1, 60.0, 95.0), (2, 2, 50.0, 90.0), (3, 1, 40.0, 80.0)] {
        upsert_entry_value(&conn, 8, unit, month(2024, m), Some(63.0), "importer").unwrap();
        upsert_entry_value(&conn, 9, unit, month(2024, m), Some(used), "importer").unwrap();
        upsert_entry_value(&conn, 7, unit, month(2024, m), Some(availability), "owner").unwrap();
    }
    upsert_entry(
        &conn,
        &KpiEntry::new(20, 3, month(2024, 2)).with_comments("New detector commissioned"),
        "owner",
    )
    .unwrap();

    let entries = query_entries(&conn, &EntryFilter::all()).unwrap();
    assert_eq!(entries.len(), 16);

    let report = unit_report(&catalog, &tree, &entries, 1, Some(2024), None, None).unwrap();
    assert_eq!(report.period, Period::Month);

    let titles: Vec<&str> = report.sections.iter().map(|s| s.title.as_str()).collect();
    assert_eq!(titles, vec!["Summary", "Operations", "Other", "Families"]);

    let json = serde_json::to_value(&report).unwrap();
    let summary = &json["sections"][0]["blocks"][0];
    assert_eq!(summary["kind"], "table");
    assert_eq!(summary["header"], serde_json::json!(["", "Jan", "Feb", "Total / Avg"]));
    // Normal Shifts: 63 + 63 in January, 63 in February
    assert_eq!(summary["rows"][0], serde_json::json!(["Normal Shifts", 126.0, 63.0, 189.0]));
    // Shifts Used: 100, 50
    assert_eq!(summary["rows"][1], serde_json::json!(["Shifts Used", 100.0, 50.0, 150.0]));
    // Availability: mean(95, 80) = 87.5, 90; total mean of means = 88.75 -> 88.8
    assert_eq!(summary["rows"][2], serde_json::json!(["Availability", 87.5, 90.0, 88.8]));

    let other = report.sections.iter().find(|s| s.title == "Other").unwrap();
    let ContentBlock::Notes(notes) = &other.blocks[1] else {
        panic!("expected notes for the text KPI");
    };
    assert_eq!(notes.notes.len(), 1);
    // Both beamlines report the KPI, so the note names its unit
    assert_eq!(notes.notes[0].label, "HXMA February");
}

#[test]
fn test_single_beamline_has_no_information_outside_its_data() {
    let conn = seeded();
    let tree = load_units(&conn).unwrap();
    let catalog = load_catalog(&conn).unwrap();

    upsert_entry(&conn, &KpiEntry::new(9, 2, month(2023, 11)).with_value(12.0), "owner").unwrap();
    let entries = query_entries(&conn, &EntryFilter::for_unit(&tree, 3)).unwrap();

    let report = unit_report(&catalog, &tree, &entries, 3, Some(2023), None, None).unwrap();
    assert_eq!(report.sections.len(), 1);
    assert_eq!(report.sections[0].title, "No information");
    assert!(report.sections[0].blocks.is_empty());
}
