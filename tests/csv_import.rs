use ordinal_valuation::import::{HistoryImporter, ImportError, RecordImporter};
use ordinal_valuation::valuation::{
    AnalysisRequest, Direction, FinancingTerms, Outcome, PropertyId, PropertyRights, PropertyRole,
    PropertyTypeProfile, Unit, ValuationEngine, VariableSpec, WeightSelection,
};

const RECORDS: &str = "\
id,role,price,sale_date,arms_length,rights,loan_amount,contract_rate,market_rate,amortization_months,term_months,location,building_area[sqm],clear_height[ft]
S,subject,,,,,,,,,,7,929.03,32
C1,comparable,\"$1,500,000\",2024-03-15,true,fee simple,,,,,,9,1000,36
C2,comparable,1200000,2024-06-01,yes,,800000,4%,0.07,360,60,6,900,30
C3,comparable,1000000,2023-11-20,,,,,,,,4,850,
C4,comparable,950000,2024-01-10,false,,,,,,,5,870,28
C5,comp,1100000,2024-02-01,,leasehold,,,,,,5,880,29
";

#[test]
fn importer_reads_transactions_units_and_gaps() {
    let records = RecordImporter::from_reader(RECORDS.as_bytes()).expect("records import");
    assert_eq!(records.len(), 6);

    let subject = &records[0];
    assert_eq!(subject.role, PropertyRole::Subject);
    assert!(subject.transaction.is_none());
    let area = subject.attributes["building_area"];
    assert_eq!(area.unit, Some(Unit::SquareMeters));
    assert!((area.canonical() - 10_000.0).abs() < 1.0);

    let c1 = records[1].transaction.as_ref().expect("transaction");
    assert_eq!(c1.price, Some(1_500_000.0));
    assert_eq!(c1.financing, FinancingTerms::Cash);

    let c2 = records[2].transaction.as_ref().expect("transaction");
    assert_eq!(
        c2.financing,
        FinancingTerms::BelowMarket {
            loan_amount: 800_000.0,
            contract_rate: 0.04,
            market_rate: 0.07,
            amortization_months: 360,
            term_months: 60,
        }
    );

    assert!(!records[3].attributes.contains_key("clear_height"));
    assert!(!records[4].transaction.as_ref().expect("transaction").arms_length);
    assert_eq!(records[5].rights, PropertyRights::Leasehold);
}

#[test]
fn imported_records_run_through_the_engine() {
    let records = RecordImporter::from_reader(RECORDS.as_bytes()).expect("records import");
    let mut request = AnalysisRequest::new(
        records,
        vec![
            VariableSpec::new("location", Direction::Descending),
            VariableSpec::new("clear_height", Direction::Descending),
        ],
    );
    request.weights = WeightSelection::Profile(PropertyTypeProfile::Logistics);
    request.area_attribute = Some("building_area".to_string());

    let analysis = ValuationEngine::default()
        .analyze(&request)
        .expect("analysis");

    let excluded: Vec<&str> = analysis
        .exclusions
        .iter()
        .map(|entry| entry.property.as_str())
        .collect();
    assert_eq!(excluded, vec!["C4", "C5"]);
    assert!(analysis
        .imputations
        .iter()
        .any(|entry| entry.property == PropertyId::from("C3") && entry.attribute == "clear_height"));
    let per_unit = analysis
        .mapping
        .indicated_price_per_unit
        .expect("per-unit price");
    let area = analysis.mapping.subject_area.expect("subject area");
    assert!((per_unit * area - analysis.mapping.indicated_total_price).abs() < 1e-6);
}

#[test]
fn malformed_rows_report_their_line() {
    let csv = "id,role,price,location\nS,subject,,7\nC1,comparable,lots,9\n";
    let err = RecordImporter::from_reader(csv.as_bytes()).expect_err("bad price");
    match err {
        ImportError::Row { line, message } => {
            assert_eq!(line, 3);
            assert!(message.contains("price"));
        }
        other => panic!("unexpected error: {other}"),
    }

    let err = RecordImporter::from_reader("name,price\nS,1\n".as_bytes()).expect_err("no id");
    assert!(matches!(err, ImportError::MissingColumn("id")));
}

#[test]
fn history_import_reads_ranks_and_outcomes() {
    let csv = "id,location,condition,won\nH1,1,2,true\nH2,2,1,no\n";
    let history = HistoryImporter::from_reader(csv.as_bytes()).expect("history import");
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].ranks["location"], 1.0);
    assert_eq!(history[0].outcome, Outcome::Won(true));
    assert_eq!(history[1].outcome, Outcome::Won(false));
}
