use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use camhal::callbacks::{CameraCallbacks, RecordingFrame};
use camhal::device::sim::SimulatedDevice;
use camhal::device::{ImagingDevice, StreamKind};
use camhal::params::Size;
use camhal::{CapturePipeline, MsgType, PipelineConfig};

use clap::{value_parser, Arg, Command};

#[derive(Default)]
struct Client {
    preview_frames: AtomicUsize,
    video_frames: AtomicUsize,
    picture: Mutex<Option<Vec<u8>>>,
    picture_ready: Condvar,
}

impl CameraCallbacks for Client {
    fn notify(&self, msg: MsgType, ext1: i32, ext2: i32) {
        if msg == MsgType::ERROR {
            eprintln!("Camera error {} ({})", ext1, ext2);
        } else if msg == MsgType::SHUTTER {
            println!("Click!");
        } else if msg == MsgType::FOCUS {
            println!("Focus {}", if ext1 != 0 { "locked" } else { "failed" });
        }
    }

    fn data(&self, msg: MsgType, data: &[u8]) {
        if msg == MsgType::PREVIEW_FRAME {
            self.preview_frames.fetch_add(1, Ordering::SeqCst);
        } else if msg == MsgType::COMPRESSED_IMAGE {
            *self.picture.lock().unwrap() = Some(data.to_vec());
            self.picture_ready.notify_all();
        }
    }

    fn data_timestamp(&self, _msg: MsgType, frame: RecordingFrame, timestamp: Duration) {
        let count = self.video_frames.fetch_add(1, Ordering::SeqCst);
        if count % 30 == 0 {
            println!(
                "Video frame {} at {:?} ({} bytes)",
                frame.sequence(),
                timestamp,
                frame.buffer().bytes_used()
            );
        }
        // Dropping the frame gives it back to the device.
    }
}

fn parse_size(s: &str) -> Result<Size, String> {
    const ERROR_MSG: &str = "expected a size like \"640x480\"";
    let (width, height) = s.split_once('x').ok_or(ERROR_MSG)?;
    let width = width.parse().map_err(|_| ERROR_MSG)?;
    let height = height.parse().map_err(|_| ERROR_MSG)?;
    Ok(Size::new(width, height))
}

fn main() {
    env_logger::init();

    let matches = Command::new("Simulated camera capture")
        .arg(
            Arg::new("num_frames")
                .long("stop_after")
                .takes_value(true)
                .default_value("90")
                .value_parser(value_parser!(usize))
                .help("Stop after a given number of preview frames"),
        )
        .arg(
            Arg::new("preview_size")
                .long("preview_size")
                .takes_value(true)
                .default_value("640x480")
                .value_parser(parse_size)
                .help("Size of the preview frames (e.g. \"640x480\")"),
        )
        .arg(
            Arg::new("interval")
                .long("interval")
                .takes_value(true)
                .default_value("33")
                .value_parser(value_parser!(u64))
                .help("Milliseconds between two frames of the simulated sensor"),
        )
        .arg(
            Arg::new("record")
                .long("record")
                .help("Record video alongside the preview"),
        )
        .arg(
            Arg::new("output_file")
                .long("save")
                .takes_value(true)
                .value_parser(value_parser!(PathBuf))
                .help("Take a picture at the end and save it to a file"),
        )
        .get_matches();

    let stop_after = *matches.get_one::<usize>("num_frames").unwrap();
    let preview_size = *matches.get_one::<Size>("preview_size").unwrap();
    let interval = Duration::from_millis(*matches.get_one::<u64>("interval").unwrap());
    let record = matches.is_present("record");
    let output_file = matches.get_one::<PathBuf>("output_file").cloned();

    let lets_quit = Arc::new(AtomicBool::new(false));
    // Setup the Ctrl+c handler.
    {
        let lets_quit_handler = lets_quit.clone();
        ctrlc::set_handler(move || {
            lets_quit_handler.store(true, Ordering::SeqCst);
        })
        .expect("Failed to set Ctrl-C handler.");
    }

    let device = Arc::new(SimulatedDevice::default());
    let pipeline = CapturePipeline::open(
        Arc::clone(&device) as Arc<dyn ImagingDevice>,
        PipelineConfig::new().debug_fps(),
    )
    .expect("Failed to open pipeline");

    let client = Arc::new(Client::default());
    pipeline.set_callbacks(Some(client.clone()));
    pipeline.enable_msg_type(
        MsgType::ERROR
            | MsgType::SHUTTER
            | MsgType::FOCUS
            | MsgType::PREVIEW_FRAME
            | MsgType::VIDEO_FRAME
            | MsgType::COMPRESSED_IMAGE,
    );

    let mut params = pipeline.parameters();
    params.preview_size = preview_size;
    params.video_size = preview_size;
    pipeline
        .set_parameters(params)
        .expect("Invalid preview size");

    pipeline.start_preview().expect("Failed to start preview");
    let preview_sensor = device.run_sensor(StreamKind::Preview, interval);
    let video_sensor = if record {
        pipeline.start_recording().expect("Failed to start recording");
        Some(device.run_sensor(StreamKind::Video, interval))
    } else {
        None
    };
    pipeline.auto_focus().expect("Failed to start autofocus");

    let start_time = Instant::now();
    while !lets_quit.load(Ordering::SeqCst) {
        let frames = client.preview_frames.load(Ordering::SeqCst);
        if frames >= stop_after {
            break;
        }
        let elapsed = start_time.elapsed();
        print!(
            "\rPreview frames: {:#5} fps: {:#5.1}",
            frames,
            frames as f32 / elapsed.as_secs_f32().max(f32::EPSILON)
        );
        io_flush();
        std::thread::sleep(Duration::from_millis(100));
    }
    println!();

    if let Some(video_sensor) = video_sensor {
        pipeline.stop_recording().expect("Failed to stop recording");
        video_sensor.stop();
    }

    if let Some(path) = output_file {
        pipeline.take_picture().expect("Failed to take picture");
        let picture = client.picture.lock().unwrap();
        let (picture, _) = client
            .picture_ready
            .wait_timeout_while(picture, Duration::from_secs(5), |p| p.is_none())
            .unwrap();
        match picture.as_ref() {
            Some(jpeg) => {
                let mut file = File::create(&path).expect("Invalid output file specified.");
                file.write_all(jpeg).expect("Error while writing file");
                println!("Saved {} bytes picture to {}", jpeg.len(), path.display());
            }
            None => eprintln!("No picture received"),
        }
    }

    pipeline.stop_preview().expect("Failed to stop preview");
    preview_sensor.stop();

    let mut dump = String::new();
    pipeline.dump(&mut dump).expect("Failed to dump pipeline");
    println!("{}", dump);
    pipeline.release();
}

fn io_flush() {
    let _ = std::io::stdout().flush();
}
