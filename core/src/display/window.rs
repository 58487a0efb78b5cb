//! Native window sink
//!
//! One winit window per title, created the first time that title is shown.
//! The event loop is pumped from `show` so the driver loop stays in charge of
//! timing. Frames are uploaded to a texture and drawn with a nearest-neighbour
//! blit, letterboxed to keep their aspect ratio.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, EventLoop};
use winit::platform::pump_events::{EventLoopExtPumpEvents, PumpStatus};
use winit::window::{Window, WindowId};

use super::FrameSink;
use crate::error::DisplayError;
use crate::frame::Frame;

/// Pump attempts while waiting for a requested window to appear.
const OPEN_ATTEMPTS: usize = 10;

/// Format of the uploaded frame texture (frames carry sRGB-encoded RGBA8).
const FRAME_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8UnormSrgb;

/// Shows frames in native windows.
pub struct WindowSink {
    event_loop: EventLoop<()>,
    handler: WindowEvents,
    instance: wgpu::Instance,
    gpu: Option<Gpu>,
    targets: HashMap<String, Target>,
    closed: HashSet<String>,
}

impl WindowSink {
    /// Create the sink. Windows start at `scale` times the frame size.
    pub fn new(scale: u32) -> Result<Self, DisplayError> {
        let event_loop = EventLoop::new()
            .map_err(|e| DisplayError::Backend(format!("failed to create event loop: {}", e)))?;
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        Ok(Self {
            event_loop,
            handler: WindowEvents::new(scale.max(1)),
            instance,
            gpu: None,
            targets: HashMap::new(),
            closed: HashSet::new(),
        })
    }

    /// Process pending window events without blocking.
    fn pump(&mut self) {
        if let PumpStatus::Exit(code) = self
            .event_loop
            .pump_app_events(Some(Duration::ZERO), &mut self.handler)
        {
            tracing::debug!("Event loop exited with code {}", code);
        }

        for title in self.handler.closed.drain(..) {
            if self.targets.remove(&title).is_some() {
                tracing::info!("Window \"{}\" closed", title);
            }
            self.closed.insert(title);
        }

        for (title, size) in self.handler.resized.drain(..) {
            if let (Some(target), Some(gpu)) = (self.targets.get_mut(&title), &self.gpu) {
                target.resize(&gpu.device, size);
            }
        }
    }

    /// Open a window for `title` and set up its surface.
    fn open_target(&mut self, title: &str, frame: &Frame) -> Result<(), DisplayError> {
        let (width, height) = display_size(frame);
        self.handler.requests.push(WindowRequest {
            title: title.to_string(),
            width,
            height,
        });

        let mut window = None;
        for _ in 0..OPEN_ATTEMPTS {
            self.pump();
            if let Some(error) = self.handler.error.take() {
                return Err(DisplayError::Backend(error));
            }
            if let Some(index) = self.handler.opened.iter().position(|(t, _)| t == title) {
                window = Some(self.handler.opened.swap_remove(index).1);
                break;
            }
        }
        let window = window
            .ok_or_else(|| DisplayError::Backend(format!("window \"{}\" did not open", title)))?;

        let surface = self
            .instance
            .create_surface(window.clone())
            .map_err(|e| DisplayError::Backend(format!("failed to create surface: {}", e)))?;

        if self.gpu.is_none() {
            self.gpu = Some(Gpu::new(&self.instance, &surface)?);
        }
        let Some(gpu) = &self.gpu else {
            return Err(DisplayError::Backend("GPU not initialised".to_string()));
        };

        let target = Target::new(gpu, window, surface, frame);
        self.targets.insert(title.to_string(), target);
        Ok(())
    }
}

impl FrameSink for WindowSink {
    fn show(&mut self, title: &str, frame: &Frame) -> Result<(), DisplayError> {
        if frame.is_empty() {
            return Err(DisplayError::EmptyFrame {
                width: frame.width,
                height: frame.height,
            });
        }

        self.pump();
        if self.closed.contains(title) {
            return Err(DisplayError::WindowClosed(title.to_string()));
        }
        if !self.targets.contains_key(title) {
            self.open_target(title, frame)?;
        }

        let (Some(gpu), Some(target)) = (&self.gpu, self.targets.get_mut(title)) else {
            return Err(DisplayError::WindowClosed(title.to_string()));
        };
        target.draw(gpu, frame)
    }

    fn close(&mut self) {
        if self.targets.is_empty() {
            return;
        }
        // Dropping the targets destroys their windows.
        self.targets.clear();
        self.handler.forget_windows();
        self.pump();
        tracing::debug!("Window sink closed");
    }
}

// ============================================================================
// Event handling
// ============================================================================

struct WindowRequest {
    title: String,
    width: u32,
    height: u32,
}

/// Collects window events for the sink between pumps.
struct WindowEvents {
    scale: u32,
    requests: Vec<WindowRequest>,
    opened: Vec<(String, Arc<Window>)>,
    titles: HashMap<WindowId, String>,
    closed: Vec<String>,
    resized: Vec<(String, PhysicalSize<u32>)>,
    error: Option<String>,
}

impl WindowEvents {
    fn new(scale: u32) -> Self {
        Self {
            scale,
            requests: Vec::new(),
            opened: Vec::new(),
            titles: HashMap::new(),
            closed: Vec::new(),
            resized: Vec::new(),
            error: None,
        }
    }

    fn open_requested(&mut self, event_loop: &ActiveEventLoop) {
        for request in self.requests.drain(..) {
            let attributes = Window::default_attributes()
                .with_title(request.title.as_str())
                .with_inner_size(PhysicalSize::new(
                    request.width * self.scale,
                    request.height * self.scale,
                ));

            match event_loop.create_window(attributes) {
                Ok(window) => {
                    let window = Arc::new(window);
                    self.titles.insert(window.id(), request.title.clone());
                    self.opened.push((request.title, window));
                }
                Err(e) => {
                    tracing::error!("Failed to create window \"{}\": {}", request.title, e);
                    self.error =
                        Some(format!("failed to create window \"{}\": {}", request.title, e));
                }
            }
        }
    }

    fn forget_windows(&mut self) {
        self.titles.clear();
        self.opened.clear();
        self.resized.clear();
    }
}

impl ApplicationHandler for WindowEvents {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        self.open_requested(event_loop);
    }

    fn window_event(
        &mut self,
        _event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent,
    ) {
        let Some(title) = self.titles.get(&window_id) else {
            return;
        };
        match event {
            WindowEvent::CloseRequested => {
                tracing::info!("Window close requested: {}", title);
                self.closed.push(title.clone());
                self.titles.remove(&window_id);
            }
            WindowEvent::Resized(size) => {
                self.resized.push((title.clone(), size));
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        self.open_requested(event_loop);
    }
}

// ============================================================================
// GPU
// ============================================================================

/// Device state shared by every window.
struct Gpu {
    adapter: wgpu::Adapter,
    device: wgpu::Device,
    queue: wgpu::Queue,
    shader: wgpu::ShaderModule,
    sampler: wgpu::Sampler,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
}

impl Gpu {
    fn new(
        instance: &wgpu::Instance,
        surface: &wgpu::Surface<'static>,
    ) -> Result<Self, DisplayError> {
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::LowPower,
            compatible_surface: Some(surface),
            force_fallback_adapter: false,
        }))
        .map_err(|e| DisplayError::Backend(format!("failed to find suitable GPU adapter: {}", e)))?;

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("Frame Device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::downlevel_defaults(),
            memory_hints: wgpu::MemoryHints::MemoryUsage,
            experimental_features: Default::default(),
            trace: wgpu::Trace::Off,
        }))
        .map_err(|e| DisplayError::Backend(format!("failed to create GPU device: {}", e)))?;

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Blit Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Blit Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("../../shaders/blit.wgsl").into()),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Blit Bind Group Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Blit Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        tracing::info!("Window graphics initialized: {}", adapter.get_info().name);

        Ok(Self {
            adapter,
            device,
            queue,
            shader,
            sampler,
            bind_group_layout,
            pipeline_layout,
        })
    }

    fn create_pipeline(&self, surface_format: wgpu::TextureFormat) -> wgpu::RenderPipeline {
        self.device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Blit Pipeline"),
            layout: Some(&self.pipeline_layout),
            vertex: wgpu::VertexState {
                module: &self.shader,
                entry_point: Some("vs_main"),
                buffers: &[],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &self.shader,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format: surface_format,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: None,
                unclipped_depth: false,
                polygon_mode: wgpu::PolygonMode::Fill,
                conservative: false,
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState {
                count: 1,
                mask: !0,
                alpha_to_coverage_enabled: false,
            },
            multiview: None,
            cache: None,
        })
    }

    fn create_frame_texture(&self, width: u32, height: u32) -> (wgpu::Texture, wgpu::BindGroup) {
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Frame Texture"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: FRAME_FORMAT,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Blit Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
            ],
        });
        (texture, bind_group)
    }
}

/// One window with its surface and frame texture.
struct Target {
    surface: wgpu::Surface<'static>,
    config: wgpu::SurfaceConfiguration,
    pipeline: wgpu::RenderPipeline,
    texture: wgpu::Texture,
    bind_group: wgpu::BindGroup,
    // Declared last so the surface is dropped before its window.
    window: Arc<Window>,
}

impl Target {
    fn new(gpu: &Gpu, window: Arc<Window>, surface: wgpu::Surface<'static>, frame: &Frame) -> Self {
        let size = window.inner_size();
        let caps = surface.get_capabilities(&gpu.adapter);
        let format = caps
            .formats
            .iter()
            .find(|f| f.is_srgb())
            .or_else(|| caps.formats.first())
            .copied()
            .unwrap_or(wgpu::TextureFormat::Bgra8UnormSrgb);
        let alpha_mode = caps
            .alpha_modes
            .first()
            .copied()
            .unwrap_or(wgpu::CompositeAlphaMode::Auto);

        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: wgpu::PresentMode::AutoVsync,
            alpha_mode,
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&gpu.device, &config);

        let pipeline = gpu.create_pipeline(format);
        let (texture, bind_group) = gpu.create_frame_texture(frame.width, frame.height);

        tracing::debug!(
            "Window surface configured: {}x{}, format: {:?}",
            config.width,
            config.height,
            format
        );

        Self {
            surface,
            config,
            pipeline,
            texture,
            bind_group,
            window,
        }
    }

    fn resize(&mut self, device: &wgpu::Device, size: PhysicalSize<u32>) {
        if size.width > 0 && size.height > 0 {
            self.config.width = size.width;
            self.config.height = size.height;
            self.surface.configure(device, &self.config);
        }
    }

    fn draw(&mut self, gpu: &Gpu, frame: &Frame) -> Result<(), DisplayError> {
        if self.texture.width() != frame.width || self.texture.height() != frame.height {
            let (texture, bind_group) = gpu.create_frame_texture(frame.width, frame.height);
            self.texture = texture;
            self.bind_group = bind_group;
        }

        gpu.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &self.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &frame.pixels,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(frame.width * 4),
                rows_per_image: Some(frame.height),
            },
            wgpu::Extent3d {
                width: frame.width,
                height: frame.height,
                depth_or_array_layers: 1,
            },
        );

        let output = match self.surface.get_current_texture() {
            Ok(output) => output,
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                // Skip this frame; the next one draws to the fresh surface.
                self.surface.configure(&gpu.device, &self.config);
                return Ok(());
            }
            Err(wgpu::SurfaceError::Timeout) => {
                tracing::warn!("Surface timeout, skipping frame");
                return Ok(());
            }
            Err(e) => return Err(DisplayError::Backend(format!("surface error: {}", e))),
        };
        let view = output
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());

        let (x, y, width, height) =
            fit_viewport(frame.aspect(), (self.config.width, self.config.height));

        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Blit Encoder"),
            });
        {
            let mut blit_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Blit Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                    depth_slice: None,
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            blit_pass.set_pipeline(&self.pipeline);
            blit_pass.set_bind_group(0, &self.bind_group, &[]);
            blit_pass.set_viewport(x, y, width, height, 0.0, 1.0);
            blit_pass.draw(0..3, 0..1);
        }

        gpu.queue.submit(std::iter::once(encoder.finish()));
        self.window.pre_present_notify();
        output.present();
        Ok(())
    }
}

/// Unscaled window size for `frame`: its height, with the width following
/// the display aspect.
fn display_size(frame: &Frame) -> (u32, u32) {
    let width = (frame.height as f32 * frame.aspect()).round() as u32;
    (width.max(1), frame.height.max(1))
}

/// Largest centred rectangle with the given aspect ratio (width / height)
/// that fits the window, as `(x, y, width, height)`.
fn fit_viewport(aspect: f32, window: (u32, u32)) -> (f32, f32, f32, f32) {
    let (window_width, window_height) = (window.0 as f32, window.1 as f32);

    let (width, height) = if window_width / window_height > aspect {
        (window_height * aspect, window_height)
    } else {
        (window_width, window_width / aspect)
    };

    (
        (window_width - width) / 2.0,
        (window_height - height) / 2.0,
        width,
        height,
    )
}
