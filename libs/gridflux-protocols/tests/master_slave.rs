//! Master against the in-memory slave over loopback TCP

use std::sync::Arc;
use std::time::Duration;

use gridflux_comlink::bytes::u32_to_regs;
use gridflux_comlink::{LinkError, RegisterOrder, Scalar, ScalarKind};
use gridflux_protocols::modbus::{
    decode_words, encode_words, DataType, ExtractSpec, MasterConfig, ModbusMaster,
    ModbusTcpServer, RegKind, RegisterBank,
};
use tokio_util::sync::CancellationToken;

async fn start_slave(unit_id: u8) -> (Arc<RegisterBank>, std::net::SocketAddr, CancellationToken) {
    let bank = Arc::new(RegisterBank::new(unit_id));
    let server = ModbusTcpServer::bind("127.0.0.1:0", bank.clone())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let cancel = CancellationToken::new();
    tokio::spawn(server.run(cancel.clone()));
    (bank, addr, cancel)
}

fn master_for(addr: std::net::SocketAddr) -> ModbusMaster {
    let mut config = MasterConfig::tcp(addr.ip().to_string(), addr.port());
    config.timeout = Duration::from_millis(500);
    config.send_interval = Duration::from_millis(1);
    ModbusMaster::new(config)
}

#[tokio::test]
async fn test_holding_read_decodes_uint32() {
    let (bank, addr, cancel) = start_slave(1).await;
    bank.set_holding(100, &[0x1234, 0x5678]);

    let mut master = master_for(addr);
    master.open().await.unwrap();

    let words = master.read_words(1, RegKind::Holding, 100, 2).await.unwrap();
    let value = decode_words(&words, &ExtractSpec::new(DataType::Uint32)).unwrap();
    assert_eq!(value.as_u32().unwrap(), 305_419_896);

    master.close().await;
    cancel.cancel();
}

#[tokio::test]
async fn test_float_with_scale_and_offset() {
    let (bank, addr, cancel) = start_slave(1).await;

    // 3.1415 stored little-endian, low word first
    let mut spec = ExtractSpec::new(DataType::Float32);
    spec.order = RegisterOrder::from_pattern("DCBA").unwrap();
    spec.scale = 2.0;
    spec.offset = 1.0;
    spec.precision = 2;
    bank.set_holding(200, &u32_to_regs(3.1415f32.to_bits(), spec.order));

    let mut master = master_for(addr);
    master.open().await.unwrap();

    let words = master.read_words(1, RegKind::Holding, 200, 2).await.unwrap();
    let value = decode_words(&words, &spec).unwrap();
    assert_eq!(value.kind(), ScalarKind::Float64);
    assert_eq!(value.as_f64().unwrap(), 7.28);

    master.close().await;
    cancel.cancel();
}

#[tokio::test]
async fn test_illegal_address_keeps_transport_open() {
    let (_bank, addr, cancel) = start_slave(1).await;

    let mut master = master_for(addr);
    master.open().await.unwrap();

    // Two registers starting at the last address run past the table
    let err = master
        .read(1, RegKind::Input, 0xFFFF, 2)
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::Exception { code: 0x02, .. }));

    // The connection is still good for the next request
    let words = master.read_words(1, RegKind::Holding, 10, 1).await.unwrap();
    assert_eq!(words, vec![0]);

    master.close().await;
    cancel.cancel();
}

#[tokio::test]
async fn test_foreign_unit_id_is_rejected() {
    let (_bank, addr, cancel) = start_slave(1).await;

    let mut config = MasterConfig::tcp(addr.ip().to_string(), addr.port());
    config.timeout = Duration::from_millis(500);
    config.send_interval = Duration::from_millis(1);
    let mut master = ModbusMaster::new(config);
    master.open().await.unwrap();

    let err = master.read(9, RegKind::Holding, 0, 1).await.unwrap_err();
    assert!(matches!(err, LinkError::Exception { code: 0x01, .. }));

    master.close().await;
    cancel.cancel();
}

#[tokio::test]
async fn test_write_then_read_roundtrip_all_orders() {
    let (_bank, addr, cancel) = start_slave(1).await;
    let mut master = master_for(addr);
    master.open().await.unwrap();

    let mut address = 1000u16;
    for pattern in ["ABCD", "CDAB", "BADC", "DCBA"] {
        for (data_type, value) in [
            (DataType::Uint16, Scalar::from_u16(0xBEEF)),
            (DataType::Int16, Scalar::from_i16(-1234)),
            (DataType::Uint32, Scalar::from_u32(0xDEAD_BEEF)),
            (DataType::Int32, Scalar::from_i32(-1_000_000)),
            (DataType::Uint64, Scalar::from_u64(0x0123_4567_89AB_CDEF)),
            (DataType::Float32, Scalar::from_f32(-12.5)),
            (DataType::Float64, Scalar::from_f64(std::f64::consts::E)),
        ] {
            let mut spec = ExtractSpec::new(data_type);
            spec.order = RegisterOrder::from_pattern(pattern).unwrap();

            let regs = encode_words(&value, &spec).unwrap();
            master
                .write_registers(1, address, &regs)
                .await
                .unwrap();

            let read = master
                .read_words(1, RegKind::Holding, address, regs.len() as u16)
                .await
                .unwrap();
            let back = decode_words(&read, &spec).unwrap();
            assert_eq!(back, value, "{} {}", pattern, data_type);

            address += regs.len() as u16;
        }
    }

    master.close().await;
    cancel.cancel();
}

#[tokio::test]
async fn test_coil_write_and_read() {
    let (bank, addr, cancel) = start_slave(1).await;
    let mut master = master_for(addr);
    master.open().await.unwrap();

    master.write_coil(1, 40, true).await.unwrap();
    master
        .write_coils(1, 41, &[false, true, true])
        .await
        .unwrap();

    let bits = master.read_bits(1, RegKind::Coil, 40, 4).await.unwrap();
    assert_eq!(bits, vec![true, false, true, true]);
    assert!(bank.coil(40));

    master.close().await;
    cancel.cancel();
}

#[tokio::test]
async fn test_timeout_and_retry_against_silent_peer() {
    // A listener that accepts and then stays silent
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut sockets = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            sockets.push(socket);
        }
    });

    let mut config = MasterConfig::tcp(addr.ip().to_string(), addr.port());
    config.timeout = Duration::from_millis(100);
    config.retry_max = 2;
    config.retry_delay = Duration::from_millis(20);
    config.send_interval = Duration::from_millis(1);
    let mut master = ModbusMaster::new(config);
    master.open().await.unwrap();

    let started = std::time::Instant::now();
    let err = master.read(1, RegKind::Holding, 0, 1).await.unwrap_err();
    assert!(matches!(err, LinkError::Timeout(_)));

    // Three attempts of ~100 ms each plus two retry pauses
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(300), "elapsed {elapsed:?}");

    // Each attempt sent one frame
    assert_eq!(master.stats().bytes_sent, 3 * 12);

    master.close().await;
}
