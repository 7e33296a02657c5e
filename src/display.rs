//! Final report rendering: one table per section, matching the shape of the
//! aggregated run result.

use gopayloader_core::RunResult;
use tabled::builder::Builder;
use tabled::settings::Style;

pub fn render(result: &RunResult) {
    println!("\nGopayloader results\n");

    print_table(
        ["Metric", "Result"],
        vec![
            ["Total time".to_string(), format!("{:?}", result.total)],
            [
                "Start time".to_string(),
                result.start.format("%a, %d %b %Y %H:%M:%S %Z").to_string(),
            ],
            [
                "End time".to_string(),
                result.end.format("%a, %d %b %Y %H:%M:%S %Z").to_string(),
            ],
            [
                "Completed requests".to_string(),
                result.completed.to_string(),
            ],
            ["Failed requests".to_string(), result.failed.to_string()],
        ],
    );

    print_table(
        ["RPS", "Count"],
        vec![
            ["Average".to_string(), format!("{:.2}", result.rps.average)],
            ["Max".to_string(), result.rps.max.to_string()],
            ["Min".to_string(), result.rps.min.to_string()],
        ],
    );

    print_table(
        ["Latency", "Duration"],
        vec![
            ["Average".to_string(), format!("{:?}", result.latency.average)],
            ["Max".to_string(), format!("{:?}", result.latency.max)],
            ["Min".to_string(), format!("{:?}", result.latency.min)],
        ],
    );

    print_table(
        ["Request size", "Bytes"],
        vec![
            ["Single".to_string(), result.req_byte_size.single.to_string()],
            ["Total".to_string(), result.req_byte_size.total.to_string()],
            [
                "Per second".to_string(),
                result.req_byte_size.per_second.to_string(),
            ],
        ],
    );

    print_table(
        ["Response size", "Bytes"],
        vec![
            [
                "Single".to_string(),
                result.resp_byte_size.single.to_string(),
            ],
            ["Total".to_string(), result.resp_byte_size.total.to_string()],
            [
                "Per second".to_string(),
                result.resp_byte_size.per_second.to_string(),
            ],
        ],
    );

    print_table(
        ["Response code", "Count"],
        result
            .responses
            .iter()
            .map(|(code, count)| [code.to_string(), count.to_string()])
            .collect(),
    );

    if !result.errors.is_empty() {
        print_table(
            ["Error", "Count"],
            result
                .errors
                .iter()
                .map(|(err, count)| [err.clone(), count.to_string()])
                .collect(),
        );
    }
}

fn print_table(header: [&str; 2], rows: Vec<[String; 2]>) {
    let mut builder = Builder::default();
    builder.push_record(header);
    for row in rows {
        builder.push_record(row);
    }
    let mut table = builder.build();
    table.with(Style::sharp());
    println!("{}", table);
}
