use scan_engine::ports::{parse_ports_str, to_port_arg};

#[test]
fn parse_single_and_ranges_and_comments() {
    let input = r#"
        # common ports
        22
        80  # http
        443 # https
        8000-8002
        8001  # duplicate
        # blank line follows

    "#;

    let ports = parse_ports_str(input).expect("parse ok");
    assert_eq!(ports, vec![22, 80, 443, 8000, 8001, 8002]);
}

#[test]
fn comma_lists_feed_the_nmap_port_argument() {
    let ports = parse_ports_str("8080, 22,8081,80,8082").expect("parse ok");
    assert_eq!(to_port_arg(&ports), "22,80,8080-8082");
}

#[test]
fn invalid_port_rejected() {
    assert!(parse_ports_str("0\n").is_err());
    assert!(parse_ports_str("70000").is_err());
    assert!(parse_ports_str("90-80").is_err());
}
