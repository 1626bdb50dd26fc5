//! Sharing one serial line between the cyclic poller, the request worker and
//! direct calls.

use futures::future::join_all;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};

use fdx_modbus_bridge::modbus::protocol::ModbusFunction;
use fdx_modbus_bridge::*;

fn config(slaves: &[u8]) -> BridgeConfig {
    let mut config = BridgeConfig::default();
    for &slave in slaves {
        config.slaves_list.insert(slave, 8);
    }
    config.cycle_read_slaves_list = slaves.to_vec();
    config.queue_maxsize = 64;
    config
}

fn bus(slaves: &[u8], delay: Duration) -> SimulatedBus {
    slaves
        .iter()
        .fold(SimulatedBus::new(), |bus, &slave| bus.with_slave(slave, 32))
        .with_response_delay(delay)
}

fn collect_responses(client: &ModbusRtuClient<SimulatedBus>) -> Arc<Mutex<Vec<RegisterResponse>>> {
    let responses = Arc::new(Mutex::new(Vec::new()));
    let sink = responses.clone();
    client.set_response_handler(Arc::new(move |response: RegisterResponse| {
        sink.lock().unwrap().push(response);
    }));
    responses
}

/// Never more than one transaction on the line, whatever the mix of callers
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_transaction_on_the_line() {
    let slaves = [1, 2, 3];
    let bus = bus(&slaves, Duration::from_millis(2));
    let mut client: ModbusRtuClient<SimulatedBus> = ModbusRtuClient::new(&config(&slaves));
    let responses = collect_responses(&client);
    client.connect_with(bus.clone()).await.unwrap();
    client.enable_cyclic_polling();

    let queue = client.queue();
    let producers: Vec<_> = (0..4u16)
        .map(|task| {
            let queue = queue.clone();
            tokio::spawn(async move {
                for i in 0..5u16 {
                    let slave = (task % 3 + 1) as u8;
                    queue.enqueue(RegisterRequest::write_single(slave, 10 + task, i));
                    sleep(Duration::from_millis(1)).await;
                }
            })
        })
        .collect();

    join_all((0..10u16).map(|i| client.write_register(20 + i, i, 1))).await;
    join_all((0..10u8).map(|i| client.read_holding_registers(0, 4, i % 3 + 1))).await;
    for producer in join_all(producers).await {
        producer.unwrap();
    }

    // Let the worker drain the queue
    let deadline = Instant::now() + Duration::from_secs(3);
    while bus.registers(1, 10, 1) != Some(vec![4]) || bus.registers(2, 11, 1) != Some(vec![4]) {
        assert!(Instant::now() < deadline, "queued writes were not executed");
        sleep(Duration::from_millis(5)).await;
    }

    client.disable_cyclic_polling();
    client.disconnect().await.unwrap();

    assert_eq!(bus.max_in_flight(), 1);
    assert_eq!(bus.registers(1, 20, 10), Some((0..10).collect()));
    let responses = responses.lock().unwrap();
    assert!(responses
        .iter()
        .any(|r| matches!(r, RegisterResponse::HoldingRegisters { slave_id: 3, .. })));
}

/// A queued write is served while polling runs, not after a long sweep
#[tokio::test]
async fn test_queued_write_not_starved_by_polling() {
    let slaves: Vec<u8> = (1..=20).collect();
    let bus = bus(&slaves, Duration::from_millis(5));
    let mut client: ModbusRtuClient<SimulatedBus> = ModbusRtuClient::new(&config(&slaves));
    client.connect_with(bus.clone()).await.unwrap();
    client.enable_cyclic_polling();
    sleep(Duration::from_millis(20)).await;

    // A full sweep takes about 100 ms; the write must land well before that
    let started = Instant::now();
    assert!(client.enqueue_write_register(7, 0x77, 20));
    while bus.registers(20, 7, 1) != Some(vec![0x77]) {
        assert!(started.elapsed() < Duration::from_millis(60), "write waited for the sweep");
        sleep(Duration::from_millis(1)).await;
    }

    client.disconnect().await.unwrap();
}

/// A write finishing does not resume polling the user switched off
#[tokio::test]
async fn test_disabled_polling_stays_disabled_after_queued_write() {
    let slaves = [1];
    let bus = bus(&slaves, Duration::from_millis(1));
    let mut client: ModbusRtuClient<SimulatedBus> = ModbusRtuClient::new(&config(&slaves));
    let responses = collect_responses(&client);
    client.connect_with(bus.clone()).await.unwrap();

    client.enable_cyclic_polling();
    sleep(Duration::from_millis(10)).await;
    client.disable_cyclic_polling();
    assert!(client.enqueue_write_register(3, 9, 1));

    timeout(Duration::from_secs(1), async {
        while !responses
            .lock()
            .unwrap()
            .iter()
            .any(|r| matches!(r, RegisterResponse::RegisterWritten { .. }))
        {
            sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();

    // One in-flight poll may still finish after disabling; nothing after that
    sleep(Duration::from_millis(20)).await;
    let before = bus.transactions().len();
    sleep(Duration::from_millis(50)).await;
    assert_eq!(bus.transactions().len(), before);
    assert!(!client.is_cyclic_polling_enabled());

    let last = bus.transactions().pop().unwrap();
    assert_eq!(last.function, ModbusFunction::WriteSingleRegister);
    assert_eq!(bus.registers(1, 3, 1), Some(vec![9]));

    client.disconnect().await.unwrap();
}
